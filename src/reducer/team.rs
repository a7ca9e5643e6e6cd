use crate::action::{Action, ActionKind};
use crate::reducer::Reducer;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TeamState {
    pub created: bool,
    pub name: String,
    /// Opaque to this crate.
    pub roster: serde_json::Value,
    pub roster_revisions: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TeamReducer;

impl Reducer for TeamReducer {
    type State = TeamState;

    fn initial_state(&self) -> TeamState {
        TeamState {
            created: false,
            name: String::new(),
            roster: serde_json::Value::Null,
            roster_revisions: 0,
        }
    }

    fn transition(&self, mut state: TeamState, action: &Action) -> TeamState {
        match &action.kind {
            ActionKind::CreateTeam(create) if !state.created => {
                state.created = true;
                state.name = create.name.clone();
            }
            ActionKind::UpdateRoster(update) if state.created => {
                state.roster = update.roster.clone();
                state.roster_revisions += 1;
            }
            _ => {}
        }
        state
    }
}
