use crate::action::{Action, ActionLog, EntityId, EntityKind, Revision, UserId};
use crate::reducer::Reducer;

/// LocalEntity is a client's copy of one entity: everything the server has confirmed, followed
/// by actions recorded locally that haven't been accepted yet.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalEntity {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub owner: UserId,
    pub team_id: Option<EntityId>,
    log: ActionLog,
    synced: Revision,
}

impl LocalEntity {
    pub fn new(entity_id: EntityId, kind: EntityKind, owner: UserId) -> Self {
        LocalEntity {
            entity_id,
            kind,
            owner,
            team_id: None,
            log: ActionLog::new(),
            synced: Revision::empty(),
        }
    }

    /// A copy whose whole log is already confirmed by the server.
    pub fn from_server(entity_id: EntityId, kind: EntityKind, owner: UserId, actions: Vec<Action>) -> Self {
        let log = ActionLog::from_actions(actions);
        let synced = log.revision();
        LocalEntity {
            entity_id,
            kind,
            owner,
            team_id: None,
            log,
            synced,
        }
    }

    pub fn with_team(mut self, team_id: EntityId) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    /// Last revision the server confirmed. This is what a write claims as its base.
    pub fn synced_revision(&self) -> Revision {
        self.synced
    }

    /// Tail of the whole local log, confirmed or not.
    pub fn local_revision(&self) -> Revision {
        self.log.revision()
    }

    /// Locally recorded actions the server hasn't accepted, oldest first.
    pub fn pending(&self) -> &[Action] {
        self.log.since(&self.synced).unwrap_or(&[])
    }

    pub fn has_pending(&self) -> bool {
        !self.pending().is_empty()
    }

    /// Optimistic local append. Returns false for a duplicate id.
    pub fn record(&mut self, action: Action) -> bool {
        self.log.append(action)
    }

    /// The server accepted everything through `revision`. The synced mark only moves forward.
    pub fn confirm(&mut self, revision: Revision) {
        let position = |r: &Revision| r.action_id().and_then(|id| self.log.position(&id));
        let target = match position(&revision) {
            Some(target) => target,
            None => return,
        };
        if position(&self.synced).map_or(true, |current| target > current) {
            self.synced = revision;
        }
    }

    /// Server actions arrived and nothing local is pending: append them and move the synced mark.
    /// Actions already present are skipped. Returns how many were new.
    pub fn fast_forward(&mut self, server_actions: &[Action]) -> usize {
        let mut appended = 0;
        for action in server_actions {
            if self.log.append(action.clone()) {
                appended += 1;
            }
        }
        self.synced = self.log.revision();
        appended
    }

    /// Discards local-only actions and takes `server_log` as the whole log.
    pub fn adopt_server_log(&mut self, server_log: Vec<Action>) {
        self.log = ActionLog::from_actions(server_log);
        self.synced = self.log.revision();
    }

    /// Drops everything after the synced revision and returns it.
    pub fn take_pending(&mut self) -> Vec<Action> {
        let synced = self.synced;
        self.log.split_off_after(&synced).unwrap_or_default()
    }

    /// Current state of the whole local log, pending actions included.
    pub fn state<R: Reducer>(&self, reducer: &R) -> R::State {
        reducer.reduce(self.log.actions())
    }
}
