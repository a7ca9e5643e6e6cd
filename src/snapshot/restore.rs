use crate::action::EntityId;
use crate::crypto::KeyRingHandle;
use crate::snapshot::store::SnapshotReader;
use crate::storage::{AppliedMarker, EntityStore};
use std::collections::HashSet;
use std::io;
use std::num::NonZeroUsize;
use crossbeam_channel::{self as channel, Sender};
use std::sync::Mutex;
use std::thread;

/// What to do with a snapshot that covers the log through `snapshot_index`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RestorePlan {
    /// This node already applied everything the snapshot holds. Only topology is merged.
    TopologyOnly,
    /// Entities are restored from the snapshot, then topology is merged.
    Full,
}

/// A node that was fully initialized and has applied at least as far as the snapshot gains
/// nothing from its data.
pub(crate) fn plan_restore(marker: AppliedMarker, snapshot_index: u64) -> RestorePlan {
    if marker.initialized && marker.index >= snapshot_index {
        RestorePlan::TopologyOnly
    } else {
        RestorePlan::Full
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct RestoreSummary {
    pub(crate) restored: usize,
    pub(crate) zombies_removed: usize,
}

/// Writes every entity in `reader` to `entities` through a pool of `workers` threads, then deletes
/// local entities the snapshot doesn't have.
///
/// Records are handed to workers through a multi-consumer channel bounded to the pool size, so at
/// most about `2 * workers` entities are in memory at once. Workers never wait on each other to
/// take the next record.
pub(crate) fn restore_entities(
    logger: &slog::Logger,
    reader: &mut SnapshotReader,
    key_ring: &KeyRingHandle,
    entities: &EntityStore,
    workers: NonZeroUsize,
) -> Result<RestoreSummary, io::Error> {
    let workers = workers.get();
    let (tx, rx) = channel::bounded::<(EntityId, Vec<u8>)>(workers);
    let first_error: Mutex<Option<io::Error>> = Mutex::new(None);
    let mut seen = HashSet::new();

    let read_result = thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let first_error = &first_error;
            scope.spawn(move || {
                for (id, sealed) in rx.iter() {
                    // After a failure the queue is still drained, so the reader never blocks.
                    if first_error.lock().expect("Restore error lock poisoned").is_some() {
                        continue;
                    }
                    let written = key_ring
                        .open(&sealed)
                        .map_err(io::Error::from)
                        .and_then(|plaintext| entities.save_plaintext(&id, &plaintext));
                    if let Err(e) = written {
                        let mut first = first_error.lock().expect("Restore error lock poisoned");
                        if first.is_none() {
                            *first = Some(e);
                        }
                    }
                }
            });
        }
        drop(rx);

        let result = feed_workers(reader, &tx, &mut seen);
        drop(tx);
        result
    });
    read_result?;

    if let Some(e) = first_error.into_inner().expect("Restore error lock poisoned") {
        return Err(e);
    }

    let mut zombies_removed = 0;
    for id in entities.list_ids()? {
        if !seen.contains(&id) {
            entities.delete(&id)?;
            zombies_removed += 1;
        }
    }

    let summary = RestoreSummary {
        restored: seen.len(),
        zombies_removed,
    };
    slog::info!(logger, "Restored snapshot: {:?}", summary);
    Ok(summary)
}

fn feed_workers(
    reader: &mut SnapshotReader,
    tx: &Sender<(EntityId, Vec<u8>)>,
    seen: &mut HashSet<EntityId>,
) -> Result<(), io::Error> {
    while let Some((id, sealed)) = reader.next_sealed_entity()? {
        if !seen.insert(id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Entity {} appears twice in snapshot", id),
            ));
        }
        if tx.send((id, sealed)).is_err() {
            break;
        }
    }
    Ok(())
}

pub(crate) fn default_workers() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind, EntityKind, EntityMetadata, EntityRecord, RecordNote, Revision, UserId};
    use crate::commitlog::Index;
    use crate::membership::Membership;
    use crate::replica::{SnapshotPoint, Term};
    use crate::snapshot::store::SnapshotStore;
    use chrono::Utc;

    fn entity(text: &str) -> EntityRecord {
        let mut record = EntityRecord::new(
            EntityId::new_random(),
            EntityKind::Game,
            EntityMetadata {
                owner: UserId::new("scorer"),
                team_id: None,
                forked_from: None,
                created_at: Utc::now(),
            },
        );
        let note = Action::new(
            ActionKind::RecordNote(RecordNote { text: text.into() }),
            UserId::new("scorer"),
            Utc::now(),
        );
        record.apply_write(&Revision::empty(), vec![note]);
        record
    }

    #[test]
    fn skips_data_when_already_applied() {
        let applied = AppliedMarker {
            index: 500,
            term: 4,
            initialized: true,
        };
        assert_eq!(plan_restore(applied, 480), RestorePlan::TopologyOnly);
        assert_eq!(plan_restore(applied, 500), RestorePlan::TopologyOnly);
        assert_eq!(plan_restore(applied, 501), RestorePlan::Full);

        let never_initialized = AppliedMarker {
            initialized: false,
            ..applied
        };
        assert_eq!(plan_restore(never_initialized, 480), RestorePlan::Full);
    }

    #[test]
    fn restores_in_parallel_and_removes_zombies() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let leader_dir = tempfile::tempdir().unwrap();
        let follower_dir = tempfile::tempdir().unwrap();

        // Leader and follower never share a key.
        let leader_ring = KeyRingHandle::ephemeral();
        let leader_entities = EntityStore::open(leader_dir.path().join("entities"), leader_ring.clone()).unwrap();
        let records: Vec<_> = (0..20).map(|i| entity(&format!("note {}", i))).collect();
        for record in records.iter() {
            leader_entities.save(record).unwrap();
        }
        let leader_snapshots =
            SnapshotStore::open(logger.clone(), leader_dir.path().join("snapshots"), leader_ring.clone(), 2).unwrap();
        let point = SnapshotPoint {
            term: Term::new(2),
            index: Index::new(480),
        };
        leader_snapshots.create(point, &leader_entities, &Membership::new()).unwrap();

        // Transfer: plaintext out of the leader's file, sealed under the follower's key.
        let follower_ring = KeyRingHandle::ephemeral();
        let follower_snapshots = SnapshotStore::open(
            logger.clone(),
            follower_dir.path().join("snapshots"),
            follower_ring.clone(),
            2,
        )
        .unwrap();
        let mut leader_reader = leader_snapshots.reader(point).unwrap();
        let mut writer = follower_snapshots.stage(leader_reader.manifest()).unwrap();
        while let Some((id, sealed)) = leader_reader.next_sealed_entity().unwrap() {
            writer
                .add_entity(&id, &leader_ring.open(&sealed).unwrap())
                .unwrap();
        }
        crate::replica::StagedSnapshot::commit(Box::new(writer.finish().unwrap())).unwrap();

        let follower_entities =
            EntityStore::open(follower_dir.path().join("entities"), follower_ring.clone()).unwrap();
        let zombie = entity("zombie");
        follower_entities.save(&zombie).unwrap();

        let mut reader = follower_snapshots.reader(point).unwrap();
        let summary = restore_entities(
            &logger,
            &mut reader,
            &follower_ring,
            &follower_entities,
            NonZeroUsize::new(4).unwrap(),
        )
        .unwrap();

        assert_eq!(
            summary,
            RestoreSummary {
                restored: 20,
                zombies_removed: 1,
            }
        );
        assert_eq!(follower_entities.load(&zombie.id).unwrap(), None);
        for record in records.iter() {
            assert_eq!(follower_entities.load(&record.id).unwrap().as_ref(), Some(record));
        }
    }

    #[test]
    fn foreign_ciphertext_fails_the_restore() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let dir = tempfile::tempdir().unwrap();
        let ring = KeyRingHandle::ephemeral();
        let entities = EntityStore::open(dir.path().join("entities"), ring.clone()).unwrap();
        // Many more records than the queue holds, so the reader must keep going after a failure.
        for i in 0..50 {
            entities.save(&entity(&format!("note {}", i))).unwrap();
        }
        let snapshots = SnapshotStore::open(logger.clone(), dir.path().join("snapshots"), ring, 2).unwrap();
        let point = SnapshotPoint {
            term: Term::new(1),
            index: Index::new(10),
        };
        snapshots.create(point, &entities, &Membership::new()).unwrap();

        let mut reader = snapshots.reader(point).unwrap();
        let err = restore_entities(
            &logger,
            &mut reader,
            &KeyRingHandle::ephemeral(),
            &entities,
            NonZeroUsize::new(3).unwrap(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn workers_share_the_queue_without_waiting_on_each_other() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let dir = tempfile::tempdir().unwrap();
        let ring = KeyRingHandle::ephemeral();
        let source = EntityStore::open(dir.path().join("source"), ring.clone()).unwrap();
        let records: Vec<_> = (0..200).map(|i| entity(&format!("note {}", i))).collect();
        for record in records.iter() {
            source.save(record).unwrap();
        }
        let snapshots = SnapshotStore::open(logger.clone(), dir.path().join("snapshots"), ring.clone(), 2).unwrap();
        let point = SnapshotPoint {
            term: Term::new(1),
            index: Index::new(200),
        };
        snapshots.create(point, &source, &Membership::new()).unwrap();

        for workers in [1, 16] {
            let target = EntityStore::open(dir.path().join(format!("target-{}", workers)), ring.clone()).unwrap();
            let mut reader = snapshots.reader(point).unwrap();
            let summary = restore_entities(
                &logger,
                &mut reader,
                &ring,
                &target,
                NonZeroUsize::new(workers).unwrap(),
            )
            .unwrap();
            assert_eq!(summary.restored, 200);
            assert_eq!(target.list_ids().unwrap().len(), 200);
            for record in records.iter() {
                assert_eq!(target.load(&record.id).unwrap().as_ref(), Some(record));
            }
        }
    }
}
