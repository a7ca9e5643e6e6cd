use crate::action::{Action, EntityId, EntityKind, EntityMetadata, EntityRecord, Revision, UserId, WriteOutcome};
use crate::commitlog::Index;
use crate::fsm::command::{FsmCommand, RequestId};
use crate::membership::{MemberRecord, Membership, MembershipStore, TrustStore};
use crate::reducer::{GameReducer, Reducer, TeamReducer};
use crate::replica::Term;
use crate::storage::{AppliedIndexStore, AppliedMarker, EntityStore};
use chrono::Utc;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What connected clients are told about once a write has been applied.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityEvent {
    /// `actions` were appended to the end of the log.
    Appended {
        entity_id: EntityId,
        revision: Revision,
        actions: Vec<Action>,
    },
    /// The whole log was replaced by a force save. `actions` is the new log.
    Replaced {
        entity_id: EntityId,
        revision: Revision,
        actions: Vec<Action>,
    },
}

impl EntityEvent {
    pub fn entity_id(&self) -> EntityId {
        match self {
            EntityEvent::Appended { entity_id, .. } | EntityEvent::Replaced { entity_id, .. } => *entity_id,
        }
    }
}

/// Result of applying one command, handed back to whoever proposed it.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    Accepted { revision: Revision },
    Conflict { current_revision: Revision },
    Forked { entity_id: EntityId, revision: Revision },
    /// Members that were new or changed. The replica needs to learn about them.
    MembershipChanged { added: Vec<MemberRecord> },
    /// The command can never succeed, e.g. a force save of an entity that doesn't exist. Every
    /// replica reaches the same verdict.
    Rejected { reason: String },
}

#[derive(Debug)]
pub struct Applied {
    pub request_id: RequestId,
    pub outcome: ApplyOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Committed entry {0:?} is not a valid command: {1}")]
    Malformed(Index, serde_json::Error),
    #[error("Failed to persist: {0}")]
    Io(io::Error),
}

/// Ways running a decoded command can fail.
enum CommandError {
    // The stored record can't be read back. Never applied over.
    Integrity(io::Error),
    Io(io::Error),
}

/// EntityFsm is the state machine every node runs committed entries through. It is driven by a
/// single task, in commit order, so it never needs to guard against itself.
pub(crate) struct EntityFsm {
    logger: slog::Logger,
    entities: Arc<EntityStore>,
    applied: Arc<AppliedIndexStore>,
    membership_store: MembershipStore,
    membership: Membership,
    trust: Arc<TrustStore>,
    events: broadcast::Sender<EntityEvent>,
}

impl EntityFsm {
    pub fn new(
        logger: slog::Logger,
        entities: Arc<EntityStore>,
        applied: Arc<AppliedIndexStore>,
        membership_store: MembershipStore,
        trust: Arc<TrustStore>,
        events: broadcast::Sender<EntityEvent>,
    ) -> Result<Self, io::Error> {
        let membership = membership_store.load()?;
        Ok(EntityFsm {
            logger,
            entities,
            applied,
            membership_store,
            membership,
            trust,
            events,
        })
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// True once FormCluster (or a snapshot of a formed cluster) has been applied.
    pub fn cluster_formed(&self) -> bool {
        self.trust.is_enforcing()
    }

    pub fn applied_marker(&self) -> AppliedMarker {
        self.applied.get()
    }

    pub fn entity_store(&self) -> &Arc<EntityStore> {
        &self.entities
    }

    /// Applies the committed entry at `index`. Entries at or below the applied marker were
    /// already applied before a restart and are skipped. Empty data is a new leader's no-op.
    ///
    /// Returns `None` when there is nobody to answer: skipped entries and no-ops.
    pub fn apply(&mut self, index: Index, term: Term, data: &[u8]) -> Result<Option<Applied>, ApplyError> {
        let marker = self.applied.get();
        if index.as_u64() <= marker.index {
            slog::debug!(self.logger, "Skipping already applied entry {:?}", index);
            return Ok(None);
        }

        let applied = if data.is_empty() {
            None
        } else {
            let command = match FsmCommand::decode(data) {
                Ok(command) => command,
                Err(e) => {
                    // Every replica decodes the same bytes, so every replica skips it.
                    self.mark_applied(index, term, marker)?;
                    return Err(ApplyError::Malformed(index, e));
                }
            };
            let request_id = command.request_id();
            let outcome = match self.apply_command(command) {
                Ok(outcome) => outcome,
                Err(CommandError::Integrity(e)) => {
                    // Local damage. The marker stays put so a restored snapshot can replay it.
                    slog::error!(self.logger, "Entry {:?} touches unreadable data: {}", index, e);
                    return Ok(Some(Applied {
                        request_id,
                        outcome: ApplyOutcome::Rejected {
                            reason: format!("Stored data failed integrity check: {}", e),
                        },
                    }));
                }
                Err(CommandError::Io(e)) => return Err(ApplyError::Io(e)),
            };
            Some(Applied { request_id, outcome })
        };

        self.mark_applied(index, term, marker)?;
        Ok(applied)
    }

    fn mark_applied(&self, index: Index, term: Term, previous: AppliedMarker) -> Result<(), ApplyError> {
        self.applied
            .set(AppliedMarker {
                index: index.as_u64(),
                term: term.as_u64(),
                initialized: previous.initialized || index == Index::start_index(),
            })
            .map_err(ApplyError::Io)
    }

    fn apply_command(&mut self, command: FsmCommand) -> Result<ApplyOutcome, CommandError> {
        match command {
            FsmCommand::AppendActions {
                entity_id,
                kind,
                owner,
                team_id,
                base_revision,
                actions,
                ..
            } => self.apply_append(entity_id, kind, owner, team_id, base_revision, actions),
            FsmCommand::ForceSave { entity_id, actions, .. } => self.apply_force_save(entity_id, actions),
            FsmCommand::CreateFork {
                source_entity_id,
                new_entity_id,
                owner,
                actions,
                ..
            } => self.apply_fork(source_entity_id, new_entity_id, owner, actions),
            FsmCommand::AddMember { member, .. } => self.apply_add_member(member),
            FsmCommand::FormCluster { members, .. } => self.apply_form_cluster(members),
        }
    }

    fn apply_append(
        &mut self,
        entity_id: EntityId,
        kind: EntityKind,
        owner: UserId,
        team_id: Option<EntityId>,
        base_revision: Revision,
        actions: Vec<Action>,
    ) -> Result<ApplyOutcome, CommandError> {
        let mut record = match self.load(&entity_id)? {
            Some(record) => record,
            None => {
                // The creation time must come from the log itself, so every replica stores the
                // same metadata.
                let created_at = actions.first().map(|a| a.timestamp).unwrap_or_else(Utc::now);
                EntityRecord::new(
                    entity_id,
                    kind,
                    EntityMetadata {
                        owner,
                        team_id,
                        forked_from: None,
                        created_at,
                    },
                )
            }
        };

        match record.apply_write(&base_revision, actions) {
            WriteOutcome::Conflict { current_revision } => Ok(ApplyOutcome::Conflict { current_revision }),
            WriteOutcome::Accepted { revision, appended } => {
                if !appended.is_empty() {
                    self.persist(&record)?;
                    self.publish(EntityEvent::Appended {
                        entity_id,
                        revision: revision.clone(),
                        actions: appended,
                    });
                }
                Ok(ApplyOutcome::Accepted { revision })
            }
        }
    }

    fn apply_force_save(&mut self, entity_id: EntityId, actions: Vec<Action>) -> Result<ApplyOutcome, CommandError> {
        let mut record = match self.load(&entity_id)? {
            Some(record) => record,
            None => {
                return Ok(ApplyOutcome::Rejected {
                    reason: format!("Entity {} doesn't exist", entity_id),
                })
            }
        };

        let revision = record.force_save(actions);
        self.persist(&record)?;
        self.publish(EntityEvent::Replaced {
            entity_id,
            revision: revision.clone(),
            actions: record.log.actions().to_vec(),
        });
        Ok(ApplyOutcome::Accepted { revision })
    }

    fn apply_fork(
        &mut self,
        source_entity_id: EntityId,
        new_entity_id: EntityId,
        owner: UserId,
        actions: Vec<Action>,
    ) -> Result<ApplyOutcome, CommandError> {
        let source = match self.load(&source_entity_id)? {
            Some(source) => source,
            None => {
                return Ok(ApplyOutcome::Rejected {
                    reason: format!("Fork source {} doesn't exist", source_entity_id),
                })
            }
        };

        if let Some(existing) = self.load(&new_entity_id)? {
            // Replay of a fork that already landed.
            if existing.metadata.forked_from == Some(source_entity_id) {
                return Ok(ApplyOutcome::Forked {
                    entity_id: new_entity_id,
                    revision: existing.revision(),
                });
            }
            return Ok(ApplyOutcome::Rejected {
                reason: format!("Entity {} already exists", new_entity_id),
            });
        }

        let created_at = actions.first().map(|a| a.timestamp).unwrap_or(source.metadata.created_at);
        let fork = source.fork(new_entity_id, owner, actions, created_at);
        self.persist(&fork)?;

        let revision = fork.revision();
        self.publish(EntityEvent::Appended {
            entity_id: new_entity_id,
            revision: revision.clone(),
            actions: fork.log.actions().to_vec(),
        });
        Ok(ApplyOutcome::Forked {
            entity_id: new_entity_id,
            revision,
        })
    }

    fn apply_add_member(&mut self, member: MemberRecord) -> Result<ApplyOutcome, CommandError> {
        if !self.membership.add(member.clone()) {
            return Ok(ApplyOutcome::MembershipChanged { added: vec![] });
        }
        self.membership_store.save(&self.membership).map_err(CommandError::Io)?;

        if self.trust.is_enforcing() {
            self.trust.enforce_membership(&self.membership).map_err(CommandError::Io)?;
        } else {
            self.trust.pin(&member.node_id, &member.public_key).map_err(CommandError::Io)?;
        }

        slog::info!(self.logger, "Applied new member {}", member.node_id);
        Ok(ApplyOutcome::MembershipChanged { added: vec![member] })
    }

    fn apply_form_cluster(&mut self, members: Vec<MemberRecord>) -> Result<ApplyOutcome, CommandError> {
        let added = self.membership.merge(&Membership::from_members(members));
        self.membership_store.save(&self.membership).map_err(CommandError::Io)?;
        self.trust.enforce_membership(&self.membership).map_err(CommandError::Io)?;

        slog::info!(
            self.logger,
            "Cluster formed with {} members. Enforcing membership.",
            self.membership.len()
        );
        Ok(ApplyOutcome::MembershipChanged { added })
    }

    /// Merges membership that arrived with a snapshot. Topology only; entity data is untouched.
    ///
    /// Snapshots are only taken of a formed cluster, so a non-empty snapshot membership is
    /// authoritative. Trust switches to enforcing it even on a node that never saw FormCluster.
    pub fn merge_topology(&mut self, snapshot_membership: &Membership) -> Result<Vec<MemberRecord>, io::Error> {
        let added = self.membership.merge(snapshot_membership);
        if !added.is_empty() {
            self.membership_store.save(&self.membership)?;
        }
        if !snapshot_membership.is_empty() && (!added.is_empty() || !self.trust.is_enforcing()) {
            self.trust.enforce_membership(&self.membership)?;
        }
        Ok(added)
    }

    /// Records that a full restore brought this node up to `index`.
    pub fn mark_restored(&self, index: Index, term: Term) -> Result<(), io::Error> {
        self.applied.set(AppliedMarker {
            index: index.as_u64(),
            term: term.as_u64(),
            initialized: true,
        })
    }

    fn load(&self, entity_id: &EntityId) -> Result<Option<EntityRecord>, CommandError> {
        self.entities.load(entity_id).map_err(|e| match e.kind() {
            ErrorKind::InvalidData => CommandError::Integrity(e),
            _ => CommandError::Io(e),
        })
    }

    fn persist(&self, record: &EntityRecord) -> Result<(), CommandError> {
        self.entities.save(record).map_err(CommandError::Io)?;

        let report = match record.kind {
            EntityKind::Game => GameReducer.replay(record.log.actions()).report,
            EntityKind::Team => TeamReducer.replay(record.log.actions()).report,
        };
        if !report.is_clean() {
            report.log(&self.logger.new(slog::o!("EntityId" => record.id.to_string())));
        }
        Ok(())
    }

    fn publish(&self, event: EntityEvent) {
        // No receivers just means no client is connected.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, RecordNote, Undo};
    use crate::crypto::KeyRingHandle;
    use crate::fsm::command::RequestId;
    use crate::membership::test_support::member;
    use crate::membership::NodeIdentity;
    use crate::storage::MemoryStableStore;
    use crate::storage::StableStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        fsm: EntityFsm,
        trust: Arc<TrustStore>,
        events: broadcast::Receiver<EntityEvent>,
        next_index: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let entities = Arc::new(EntityStore::open(dir.path().join("entities"), KeyRingHandle::ephemeral()).unwrap());
            let stable: Arc<dyn StableStore> = Arc::new(MemoryStableStore::new());
            let trust = Arc::new(TrustStore::open(stable.clone()).unwrap());
            let (tx, rx) = broadcast::channel(16);
            let fsm = EntityFsm::new(
                slog::Logger::root(slog::Discard, slog::o!()),
                entities,
                Arc::new(AppliedIndexStore::in_memory()),
                MembershipStore::new(stable),
                trust.clone(),
                tx,
            )
            .unwrap();

            Fixture {
                _dir: dir,
                fsm,
                trust,
                events: rx,
                next_index: 1,
            }
        }

        fn apply(&mut self, command: &FsmCommand) -> ApplyOutcome {
            let index = Index::new(self.next_index);
            self.next_index += 1;
            self.fsm
                .apply(index, Term::new(1), &command.encode().unwrap())
                .unwrap()
                .unwrap()
                .outcome
        }
    }

    fn note(text: &str) -> Action {
        Action::new(
            ActionKind::RecordNote(RecordNote { text: text.into() }),
            UserId::new("scorer"),
            Utc::now(),
        )
    }

    fn append(entity_id: EntityId, base: Revision, actions: Vec<Action>) -> FsmCommand {
        FsmCommand::AppendActions {
            request_id: RequestId::new_random(),
            entity_id,
            kind: EntityKind::Game,
            owner: UserId::new("scorer"),
            team_id: None,
            base_revision: base,
            actions,
        }
    }

    #[test]
    fn append_then_conflict() {
        let mut f = Fixture::new();
        let id = EntityId::new_random();
        let (a, b, c) = (note("a"), note("b"), note("c"));

        let outcome = f.apply(&append(id, Revision::empty(), vec![a.clone(), b.clone()]));
        assert_eq!(outcome, ApplyOutcome::Accepted { revision: Revision::at(b.id) });

        let outcome = f.apply(&append(id, Revision::at(a.id), vec![c]));
        assert_eq!(
            outcome,
            ApplyOutcome::Conflict {
                current_revision: Revision::at(b.id)
            }
        );

        match f.events.try_recv().unwrap() {
            EntityEvent::Appended { actions, .. } => assert_eq!(actions, vec![a, b]),
            other => panic!("Unexpected event {:?}", other),
        }
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn reapplying_an_entry_changes_nothing() {
        let mut f = Fixture::new();
        let id = EntityId::new_random();
        let a = note("a");
        let data = append(id, Revision::empty(), vec![a.clone()]).encode().unwrap();

        assert!(f.fsm.apply(Index::new(1), Term::new(1), &data).unwrap().is_some());
        let stored = f.fsm.entity_store().load(&id).unwrap();

        // Replay after a crash that lost nothing.
        assert!(f.fsm.apply(Index::new(1), Term::new(1), &data).unwrap().is_none());
        assert_eq!(f.fsm.entity_store().load(&id).unwrap(), stored);

        // Replay after a crash that lost the marker but not the entity.
        f.fsm.applied.set(AppliedMarker::default()).unwrap();
        let replayed = f.fsm.apply(Index::new(1), Term::new(1), &data).unwrap().unwrap();
        assert_eq!(replayed.outcome, ApplyOutcome::Accepted { revision: Revision::at(a.id) });
        assert_eq!(f.fsm.entity_store().load(&id).unwrap(), stored);
    }

    #[test]
    fn noop_and_malformed_entries_advance_marker() {
        let mut f = Fixture::new();
        assert!(f.fsm.apply(Index::new(1), Term::new(2), &[]).unwrap().is_none());
        assert!(f.fsm.applied_marker().initialized);

        let err = f.fsm.apply(Index::new(2), Term::new(2), b"not json").unwrap_err();
        assert!(matches!(err, ApplyError::Malformed(_, _)));
        assert_eq!(f.fsm.applied_marker().index, 2);
    }

    #[test]
    fn dangling_undo_is_stored() {
        let mut f = Fixture::new();
        let id = EntityId::new_random();
        let dangling = Action::new(
            ActionKind::Undo(Undo {
                target: crate::action::ActionId::new_random(),
            }),
            UserId::new("scorer"),
            Utc::now(),
        );

        let outcome = f.apply(&append(id, Revision::empty(), vec![dangling.clone()]));
        assert_eq!(outcome, ApplyOutcome::Accepted { revision: Revision::at(dangling.id) });
        assert_eq!(f.fsm.entity_store().load(&id).unwrap().unwrap().log.len(), 1);
    }

    #[test]
    fn force_save_and_fork() {
        let mut f = Fixture::new();
        let id = EntityId::new_random();
        let (a, b, c, d) = (note("a"), note("b"), note("c"), note("d"));
        f.apply(&append(id, Revision::empty(), vec![a.clone(), b.clone(), c.clone()]));

        let fork_id = EntityId::new_random();
        let outcome = f.apply(&FsmCommand::CreateFork {
            request_id: RequestId::new_random(),
            source_entity_id: id,
            new_entity_id: fork_id,
            owner: UserId::new("scorer"),
            actions: vec![d.clone()],
        });
        assert_eq!(
            outcome,
            ApplyOutcome::Forked {
                entity_id: fork_id,
                revision: Revision::at(d.id)
            }
        );
        let fork = f.fsm.entity_store().load(&fork_id).unwrap().unwrap();
        assert_eq!(fork.metadata.forked_from, Some(id));

        let outcome = f.apply(&FsmCommand::ForceSave {
            request_id: RequestId::new_random(),
            entity_id: id,
            owner: UserId::new("scorer"),
            actions: vec![a.clone(), b.clone()],
        });
        assert_eq!(outcome, ApplyOutcome::Accepted { revision: Revision::at(b.id) });

        let missing = f.apply(&FsmCommand::ForceSave {
            request_id: RequestId::new_random(),
            entity_id: EntityId::new_random(),
            owner: UserId::new("scorer"),
            actions: vec![a],
        });
        assert!(matches!(missing, ApplyOutcome::Rejected { .. }));
    }

    #[test]
    fn form_cluster_switches_trust_to_enforcing() {
        let mut f = Fixture::new();
        let a = member(&NodeIdentity::generate(), 3000);
        let b = member(&NodeIdentity::generate(), 3001);

        let outcome = f.apply(&FsmCommand::AddMember {
            request_id: RequestId::new_random(),
            member: a.clone(),
        });
        assert_eq!(outcome, ApplyOutcome::MembershipChanged { added: vec![a.clone()] });
        assert!(!f.trust.is_enforcing());

        let outcome = f.apply(&FsmCommand::FormCluster {
            request_id: RequestId::new_random(),
            members: vec![a.clone(), b.clone()],
        });
        assert_eq!(outcome, ApplyOutcome::MembershipChanged { added: vec![b] });
        assert!(f.trust.is_enforcing());
        assert_eq!(f.fsm.membership().len(), 2);

        let stranger = NodeIdentity::generate();
        assert!(f.trust.check(stranger.node_id(), &stranger.public_key_hex()).is_err());
        f.trust.check(&a.node_id, &a.public_key).unwrap();
    }

    #[test]
    fn snapshot_membership_is_enforced_on_a_fresh_node() {
        let mut f = Fixture::new();
        let a = member(&NodeIdentity::generate(), 3000);
        let b = member(&NodeIdentity::generate(), 3001);
        assert!(!f.fsm.cluster_formed());

        let added = f
            .fsm
            .merge_topology(&Membership::from_members(vec![a.clone(), b.clone()]))
            .unwrap();
        assert_eq!(added.len(), 2);
        assert!(f.fsm.cluster_formed());

        let stranger = NodeIdentity::generate();
        let err = f.trust.check(stranger.node_id(), &stranger.public_key_hex()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        f.trust.check(&b.node_id, &b.public_key).unwrap();

        // Nothing new, but trust already follows the merged membership.
        assert!(f.fsm.merge_topology(&Membership::from_members(vec![a])).unwrap().is_empty());
        assert!(f.fsm.cluster_formed());
    }

    #[test]
    fn empty_snapshot_membership_leaves_bootstrap_trust_alone() {
        let mut f = Fixture::new();
        assert!(f.fsm.merge_topology(&Membership::default()).unwrap().is_empty());
        assert!(!f.fsm.cluster_formed());
    }

    #[test]
    fn unreadable_entity_rejects_the_write() {
        let mut f = Fixture::new();
        let id = EntityId::new_random();
        let a = note("a");
        f.apply(&append(id, Revision::empty(), vec![a.clone()]));

        let path = f.fsm.entity_store().directory().join(format!("{}.entity", id));
        std::fs::write(&path, b"garbage").unwrap();

        let command = append(id, Revision::at(a.id), vec![note("b")]);
        let applied = f
            .fsm
            .apply(Index::new(2), Term::new(1), &command.encode().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(applied.request_id, command.request_id());
        match applied.outcome {
            ApplyOutcome::Rejected { reason } => assert!(reason.contains("integrity"), "{}", reason),
            other => panic!("Unexpected outcome {:?}", other),
        }

        // Nothing was written over the damaged file and the entry can be replayed later.
        assert_eq!(std::fs::read(&path).unwrap(), b"garbage");
        assert_eq!(f.fsm.applied_marker().index, 1);
        assert!(f.events.try_recv().is_ok());
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn action_from_a_newer_build_still_applies() {
        let mut f = Fixture::new();
        let id = EntityId::new_random();
        let newer: Action = serde_json::from_value(serde_json::json!({
            "id": "3f1a4b7e-9a55-4b7e-8f64-8f7c3e2c1a20",
            "type": "RECORD_SCORE",
            "payload": {"side": "away", "points": 2, "assist": "7"},
            "timestamp": "2024-05-01T12:00:00Z",
            "userId": "scorer",
            "schemaVersion": 3
        }))
        .unwrap();

        let outcome = f.apply(&append(id, Revision::empty(), vec![newer.clone()]));
        assert_eq!(outcome, ApplyOutcome::Accepted { revision: Revision::at(newer.id) });

        let stored = f.fsm.entity_store().load(&id).unwrap().unwrap();
        assert_eq!(stored.log.actions(), &[newer][..]);
        assert_eq!(f.fsm.applied_marker().index, 1);
    }
}
