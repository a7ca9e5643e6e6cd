use crate::action::{Action, ActionLog, Revision};
use crate::reducer::{ConsistencyReport, Reducer};

/// MaterializedView caches the reduced state of a log. The cache is never persisted; it can always
/// be discarded and rebuilt byte for byte from the log.
pub struct MaterializedView<R: Reducer> {
    reducer: R,
    log: ActionLog,
    state: R::State,
    report: ConsistencyReport,
}

#[derive(Debug, thiserror::Error)]
#[error("Cached state diverged from a fresh replay at {revision:?}")]
pub struct ViewMismatch {
    pub revision: Revision,
}

impl<R: Reducer> MaterializedView<R> {
    pub fn new(reducer: R) -> Self {
        Self::from_log(reducer, ActionLog::new())
    }

    pub fn from_log(reducer: R, log: ActionLog) -> Self {
        let replay = reducer.replay(log.actions());
        MaterializedView {
            reducer,
            log,
            state: replay.state,
            report: replay.report,
        }
    }

    pub fn state(&self) -> &R::State {
        &self.state
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn revision(&self) -> Revision {
        self.log.revision()
    }

    pub fn report(&self) -> &ConsistencyReport {
        &self.report
    }

    /// Appends one action. A new tail action can't be neutralized, so anything but an UNDO is
    /// applied incrementally. An UNDO changes which earlier actions count and forces a rebuild.
    pub fn push(&mut self, action: Action) -> bool {
        let is_undo = action.kind.is_undo();
        if !self.log.append(action.clone()) {
            return false;
        }

        if is_undo {
            self.rebuild();
        } else {
            let state = self.state.clone();
            self.state = self.reducer.transition(state, &action);
        }
        true
    }

    pub fn replace_log(&mut self, log: ActionLog) {
        self.log = log;
        self.rebuild();
    }

    pub fn rebuild(&mut self) {
        let replay = self.reducer.replay(self.log.actions());
        self.state = replay.state;
        self.report = replay.report;
    }

    /// Replays the log from scratch and compares with the cached state, including its serialized
    /// bytes.
    pub fn verify(&self) -> Result<(), ViewMismatch> {
        let fresh = self.reducer.reduce(self.log.actions());

        let bytes_match = match (serde_json::to_vec(&fresh), serde_json::to_vec(&self.state)) {
            (Ok(fresh_bytes), Ok(cached_bytes)) => fresh_bytes == cached_bytes,
            _ => false,
        };

        if fresh == self.state && bytes_match {
            Ok(())
        } else {
            Err(ViewMismatch {
                revision: self.log.revision(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, CreateGame, RecordScore, Side, StartPeriod, Undo, UserId};
    use crate::reducer::GameReducer;
    use chrono::Utc;

    fn act(kind: ActionKind) -> Action {
        Action::new(kind, UserId::new("scorer"), Utc::now())
    }

    fn score(points: i64) -> Action {
        act(ActionKind::RecordScore(RecordScore {
            side: Side::Home,
            points,
            player: None,
        }))
    }

    #[test]
    fn incremental_and_rebuilt_views_agree() {
        let mut view = MaterializedView::new(GameReducer);
        view.push(act(ActionKind::CreateGame(CreateGame {
            home_name: "Owls".into(),
            away_name: "Hawks".into(),
            periods: 4,
        })));
        view.push(act(ActionKind::StartPeriod(StartPeriod { period: 1 })));

        let two = score(2);
        view.push(two.clone());
        view.push(score(3));
        assert_eq!(view.state().home_score, 5);
        view.verify().unwrap();

        view.push(act(ActionKind::Undo(Undo { target: two.id })));
        assert_eq!(view.state().home_score, 3);
        view.verify().unwrap();

        // Discard the cache and compare.
        let rebuilt = MaterializedView::from_log(GameReducer, view.log().clone());
        assert_eq!(
            serde_json::to_vec(rebuilt.state()).unwrap(),
            serde_json::to_vec(view.state()).unwrap()
        );
    }

    #[test]
    fn duplicate_push_is_ignored() {
        let mut view = MaterializedView::new(GameReducer);
        let create = act(ActionKind::CreateGame(CreateGame {
            home_name: "A".into(),
            away_name: "B".into(),
            periods: 2,
        }));

        assert!(view.push(create.clone()));
        assert!(!view.push(create));
        assert_eq!(view.state().actions_applied, 1);
    }
}
