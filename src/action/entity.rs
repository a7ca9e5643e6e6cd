use crate::action::{Action, ActionLog, Revision, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new_random() -> Self {
        EntityId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        EntityId(uuid)
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(EntityId)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Game,
    Team,
}

impl EntityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "game" => Some(EntityKind::Game),
            "team" => Some(EntityKind::Team),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Game => "game",
            EntityKind::Team => "team",
        }
    }
}

/// The only non-derivable facts about an entity besides its log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub owner: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<EntityId>,
    pub created_at: DateTime<Utc>,
}

/// EntityRecord is the durable form of a game or team: metadata plus its action log. Derived
/// state is never part of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub metadata: EntityMetadata,
    #[serde(rename = "actions")]
    pub log: ActionLog,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome {
    Accepted {
        revision: Revision,
        /// Actions that were not already in the log. Empty for a retried write.
        appended: Vec<Action>,
    },
    Conflict {
        current_revision: Revision,
    },
}

impl EntityRecord {
    pub fn new(id: EntityId, kind: EntityKind, metadata: EntityMetadata) -> Self {
        EntityRecord {
            id,
            kind,
            metadata,
            log: ActionLog::new(),
        }
    }

    pub fn revision(&self) -> Revision {
        self.log.revision()
    }

    /// Optimistic append. Accepted iff `base` is the current tail. A batch whose every action is
    /// already in the log is a retry of a write that already landed, and is accepted as a no-op.
    pub fn apply_write(&mut self, base: &Revision, actions: Vec<Action>) -> WriteOutcome {
        let current = self.log.revision();

        if *base != current {
            if !actions.is_empty() && actions.iter().all(|a| self.log.contains(&a.id)) {
                return WriteOutcome::Accepted {
                    revision: current,
                    appended: Vec::new(),
                };
            }
            return WriteOutcome::Conflict {
                current_revision: current,
            };
        }

        let mut appended = Vec::with_capacity(actions.len());
        for action in actions {
            if self.log.append(action.clone()) {
                appended.push(action);
            }
        }

        WriteOutcome::Accepted {
            revision: self.log.revision(),
            appended,
        }
    }

    /// Replaces the log with the client's copy, unconditionally.
    pub fn force_save(&mut self, actions: Vec<Action>) -> Revision {
        self.log = ActionLog::from_actions(actions);
        self.log.revision()
    }

    /// A new entity seeded from a diverged client log. The caller is responsible for minting
    /// fresh action ids.
    pub fn fork(&self, new_id: EntityId, owner: UserId, actions: Vec<Action>, now: DateTime<Utc>) -> EntityRecord {
        EntityRecord {
            id: new_id,
            kind: self.kind,
            metadata: EntityMetadata {
                owner,
                team_id: self.metadata.team_id,
                forked_from: Some(self.id),
                created_at: now,
            },
            log: ActionLog::from_actions(actions),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, RecordNote};

    fn note(text: &str) -> Action {
        Action::new(
            ActionKind::RecordNote(RecordNote { text: text.to_string() }),
            UserId::new("u"),
            Utc::now(),
        )
    }

    fn game() -> EntityRecord {
        EntityRecord::new(
            EntityId::new_random(),
            EntityKind::Game,
            EntityMetadata {
                owner: UserId::new("owner"),
                team_id: None,
                forked_from: None,
                created_at: Utc::now(),
            },
        )
    }

    #[test]
    fn write_to_empty_log_with_empty_base() {
        let mut record = game();
        let (a, b) = (note("a"), note("b"));

        let outcome = record.apply_write(&Revision::empty(), vec![a.clone(), b.clone()]);
        assert_eq!(
            outcome,
            WriteOutcome::Accepted {
                revision: Revision::at(b.id),
                appended: vec![a, b],
            }
        );
    }

    #[test]
    fn stale_base_is_a_conflict() {
        let mut record = game();
        let (a, b, c) = (note("a"), note("b"), note("c"));
        record.apply_write(&Revision::empty(), vec![a.clone(), b.clone()]);

        let outcome = record.apply_write(&Revision::at(a.id), vec![c]);
        assert_eq!(
            outcome,
            WriteOutcome::Conflict {
                current_revision: Revision::at(b.id)
            }
        );
        assert_eq!(record.log.len(), 2);
    }

    #[test]
    fn retried_write_is_accepted_without_change() {
        let mut record = game();
        let (a, b) = (note("a"), note("b"));
        record.apply_write(&Revision::empty(), vec![a.clone(), b.clone()]);

        // Same batch again with the original (now stale) base.
        let outcome = record.apply_write(&Revision::empty(), vec![a, b.clone()]);
        assert_eq!(
            outcome,
            WriteOutcome::Accepted {
                revision: Revision::at(b.id),
                appended: vec![],
            }
        );
        assert_eq!(record.log.len(), 2);
    }

    #[test]
    fn force_save_replaces_log() {
        let mut record = game();
        let (a, b, c) = (note("a"), note("b"), note("c"));
        record.apply_write(&Revision::empty(), vec![a.clone(), b]);

        let revision = record.force_save(vec![a, c.clone()]);
        assert_eq!(revision, Revision::at(c.id));
        assert_eq!(record.log.len(), 2);
    }

    #[test]
    fn json_shape_has_no_derived_state() {
        let mut record = game();
        record.apply_write(&Revision::empty(), vec![note("a")]);

        let value = serde_json::to_value(&record).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 4);
        assert!(value["actions"].is_array());

        let decoded = EntityRecord::from_json_bytes(&record.to_json_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }
}
