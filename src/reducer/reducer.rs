use crate::action::{effective_actions, Action, ActionId, Resolution};
use serde::Serialize;
use std::fmt::Debug;

/// Reducer is a table of pure transition functions. `transition` must not read clocks, randomness
/// or anything else outside of `state` and `action`, so that every replica computes the same
/// state from the same log.
pub trait Reducer {
    type State: Clone + Debug + PartialEq + Serialize;

    fn initial_state(&self) -> Self::State;

    /// Unknown action types must return `state` unchanged.
    fn transition(&self, state: Self::State, action: &Action) -> Self::State;

    /// Replays the effective log, oldest first.
    fn reduce(&self, actions: &[Action]) -> Self::State {
        self.replay(actions).state
    }

    fn replay(&self, actions: &[Action]) -> Replay<Self::State> {
        let resolution = Resolution::resolve(actions);

        let mut state = self.initial_state();
        for action in effective_actions(actions, &resolution) {
            state = self.transition(state, action);
        }

        Replay {
            state,
            report: ConsistencyReport {
                dangling_undos: resolution.dangling_undos().to_vec(),
            },
        }
    }
}

pub struct Replay<S> {
    pub state: S,
    pub report: ConsistencyReport,
}

/// Findings of the post-replay consistency check. None of them stop a replay.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsistencyReport {
    pub dangling_undos: Vec<ActionId>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.dangling_undos.is_empty()
    }

    pub fn log(&self, logger: &slog::Logger) {
        for undo_id in self.dangling_undos.iter() {
            slog::warn!(logger, "UNDO {} targets an action that is not in the log", undo_id);
        }
    }
}
