use crate::action::{Action, ActionKind, Side};
use crate::reducer::Reducer;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    NotCreated,
    Scheduled,
    InPeriod,
    BetweenPeriods,
    Final,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoreEvent {
    pub side: Side,
    pub points: i64,
    pub period: Option<u32>,
    pub player: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GameState {
    pub status: GameStatus,
    pub home_name: String,
    pub away_name: String,
    pub periods: u32,
    pub current_period: Option<u32>,
    pub home_score: i64,
    pub away_score: i64,
    pub scoring: Vec<ScoreEvent>,
    pub home_lineup: serde_json::Value,
    pub away_lineup: serde_json::Value,
    pub substitutions: Vec<(Side, String, String)>,
    pub notes: Vec<String>,
    pub actions_applied: u64,
}

/// GameReducer keeps score. Actions that make no sense in the current status (e.g. a score before
/// the game exists) leave the state as it was.
#[derive(Clone, Copy, Debug, Default)]
pub struct GameReducer;

impl GameReducer {
    /// Scores saturate at the i64 bounds so every replica reduces an absurd log to the same state
    /// instead of panicking or wrapping.
    fn add_points(state: &mut GameState, side: Side, points: i64) {
        let score = match side {
            Side::Home => &mut state.home_score,
            Side::Away => &mut state.away_score,
        };
        *score = score.saturating_add(points);
    }
}

impl Reducer for GameReducer {
    type State = GameState;

    fn initial_state(&self) -> GameState {
        GameState {
            status: GameStatus::NotCreated,
            home_name: String::new(),
            away_name: String::new(),
            periods: 0,
            current_period: None,
            home_score: 0,
            away_score: 0,
            scoring: Vec::new(),
            home_lineup: serde_json::Value::Null,
            away_lineup: serde_json::Value::Null,
            substitutions: Vec::new(),
            notes: Vec::new(),
            actions_applied: 0,
        }
    }

    fn transition(&self, mut state: GameState, action: &Action) -> GameState {
        let created = state.status != GameStatus::NotCreated;
        let is_final = state.status == GameStatus::Final;

        let applied = match &action.kind {
            ActionKind::CreateGame(create) if !created => {
                state.status = GameStatus::Scheduled;
                state.home_name = create.home_name.clone();
                state.away_name = create.away_name.clone();
                state.periods = create.periods;
                true
            }
            ActionKind::StartPeriod(start) if created && !is_final && state.status != GameStatus::InPeriod => {
                state.status = GameStatus::InPeriod;
                state.current_period = Some(start.period);
                true
            }
            ActionKind::EndPeriod(_) if state.status == GameStatus::InPeriod => {
                let last_period = state.periods > 0 && state.current_period >= Some(state.periods);
                state.status = if last_period {
                    GameStatus::Final
                } else {
                    GameStatus::BetweenPeriods
                };
                true
            }
            ActionKind::RecordScore(score) if created && !is_final => {
                Self::add_points(&mut state, score.side, score.points);
                state.scoring.push(ScoreEvent {
                    side: score.side,
                    points: score.points,
                    period: state.current_period,
                    player: score.player.clone(),
                });
                true
            }
            ActionKind::AdjustScore(adjust) if created => {
                Self::add_points(&mut state, adjust.side, adjust.delta);
                true
            }
            ActionKind::SetLineup(lineup) if created && !is_final => {
                match lineup.side {
                    Side::Home => state.home_lineup = lineup.lineup.clone(),
                    Side::Away => state.away_lineup = lineup.lineup.clone(),
                }
                true
            }
            ActionKind::Substitution(sub) if created && !is_final => {
                state
                    .substitutions
                    .push((sub.side, sub.player_out.clone(), sub.player_in.clone()));
                true
            }
            ActionKind::RecordNote(note) if created => {
                state.notes.push(note.text.clone());
                true
            }
            ActionKind::EndGame(_) if created && !is_final => {
                state.status = GameStatus::Final;
                true
            }
            _ => false,
        };

        if applied {
            state.actions_applied += 1;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{AdjustScore, CreateGame, EndPeriod, RecordScore, StartPeriod, Undo, UnknownAction, UserId};
    use chrono::{TimeZone, Utc};

    fn act(kind: ActionKind, seconds: u32) -> Action {
        Action::new(
            kind,
            UserId::new("scorer"),
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, seconds).unwrap(),
        )
    }

    fn score(side: Side, points: i64, seconds: u32) -> Action {
        act(
            ActionKind::RecordScore(RecordScore {
                side,
                points,
                player: None,
            }),
            seconds,
        )
    }

    fn opening() -> Vec<Action> {
        vec![
            act(
                ActionKind::CreateGame(CreateGame {
                    home_name: "Owls".into(),
                    away_name: "Hawks".into(),
                    periods: 2,
                }),
                0,
            ),
            act(ActionKind::StartPeriod(StartPeriod { period: 1 }), 1),
        ]
    }

    #[test]
    fn scores_accumulate() {
        let mut log = opening();
        log.push(score(Side::Home, 2, 2));
        log.push(score(Side::Away, 3, 3));
        log.push(score(Side::Home, 1, 4));

        let state = GameReducer.reduce(&log);
        assert_eq!(state.home_score, 3);
        assert_eq!(state.away_score, 3);
        assert_eq!(state.status, GameStatus::InPeriod);
        assert_eq!(state.scoring.len(), 3);
    }

    #[test]
    fn reduce_is_deterministic() {
        let mut log = opening();
        log.push(score(Side::Home, 2, 2));
        log.push(act(ActionKind::EndPeriod(EndPeriod {}), 3));

        let first = serde_json::to_vec(&GameReducer.reduce(&log)).unwrap();
        for _ in 0..10 {
            assert_eq!(serde_json::to_vec(&GameReducer.reduce(&log)).unwrap(), first);
        }
    }

    #[test]
    fn redo_symmetry() {
        let mut base = opening();
        let a = score(Side::Home, 2, 2);
        base.push(a.clone());

        let u = act(ActionKind::Undo(Undo { target: a.id }), 3);
        let r = act(ActionKind::Undo(Undo { target: u.id }), 4);
        let mut undone_and_redone = base.clone();
        undone_and_redone.push(u);
        undone_and_redone.push(r);

        assert_eq!(GameReducer.reduce(&undone_and_redone), GameReducer.reduce(&base));
    }

    #[test]
    fn unknown_action_passes_state_through() {
        let mut log = opening();
        log.push(score(Side::Away, 1, 2));
        let before = GameReducer.reduce(&log);

        log.push(act(
            ActionKind::Unknown(UnknownAction {
                type_name: "REVIEW_REQUESTED".into(),
                payload: serde_json::json!({}),
            }),
            3,
        ));
        assert_eq!(GameReducer.reduce(&log), before);
    }

    #[test]
    fn extreme_scores_saturate() {
        let mut log = opening();
        log.push(score(Side::Home, i64::MAX, 2));
        log.push(score(Side::Home, 1, 3));
        log.push(act(
            ActionKind::AdjustScore(AdjustScore {
                side: Side::Away,
                delta: i64::MIN,
                reason: None,
            }),
            4,
        ));
        log.push(score(Side::Away, -1, 5));

        let state = GameReducer.reduce(&log);
        assert_eq!(state.home_score, i64::MAX);
        assert_eq!(state.away_score, i64::MIN);
        assert_eq!(state.actions_applied, 6);
    }

    #[test]
    fn last_period_end_is_final() {
        let mut log = opening();
        log.push(act(ActionKind::EndPeriod(EndPeriod {}), 2));
        log.push(act(ActionKind::StartPeriod(StartPeriod { period: 2 }), 3));
        log.push(act(ActionKind::EndPeriod(EndPeriod {}), 4));
        // Scores after the final whistle don't count.
        log.push(score(Side::Home, 5, 5));

        let state = GameReducer.reduce(&log);
        assert_eq!(state.status, GameStatus::Final);
        assert_eq!(state.home_score, 0);
    }

    #[test]
    fn replay_reports_dangling_undo() {
        let mut log = opening();
        let ghost = score(Side::Home, 1, 2);
        log.push(act(ActionKind::Undo(Undo { target: ghost.id }), 3));

        let replay = GameReducer.replay(&log);
        assert!(!replay.report.is_clean());
        assert_eq!(replay.state, GameReducer.reduce(&opening()));
    }
}
