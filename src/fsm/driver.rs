use crate::actor::WeakActorClient;
use crate::crypto::KeyRingHandle;
use crate::fsm::entity_fsm::{ApplyError, ApplyOutcome, EntityFsm};
use crate::fsm::proposer::PendingApplies;
use crate::membership::MemberRecord;
use crate::replica::{AddPeerInput, CommitStream, Committed, CommittedEntry, CompactLogInput, ReplicaMetadata, SnapshotPoint};
use crate::snapshot::{plan_restore, restore_entities, RestorePlan, SnapshotStore};
use std::io::{self, ErrorKind};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// FsmDriver feeds the commit stream into the state machine, one entry at a time, and takes care
/// of everything around applying: answering proposers, telling the replica about new members,
/// snapshotting and compacting, and restoring snapshots installed by the leader.
pub(crate) struct FsmDriver {
    logger: slog::Logger,
    fsm: EntityFsm,
    commit_stream: CommitStream,
    pending: PendingApplies,
    actor_client: WeakActorClient,
    snapshots: Arc<SnapshotStore>,
    key_ring: KeyRingHandle,
    snapshot_threshold: u64,
    restore_workers: NonZeroUsize,
    applied_since_snapshot: u64,
}

impl FsmDriver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        logger: slog::Logger,
        fsm: EntityFsm,
        commit_stream: CommitStream,
        pending: PendingApplies,
        actor_client: WeakActorClient,
        snapshots: Arc<SnapshotStore>,
        key_ring: KeyRingHandle,
        snapshot_threshold: u64,
        restore_workers: NonZeroUsize,
    ) -> Self {
        FsmDriver {
            logger: logger.new(slog::o!("Task" => "FsmDriver")),
            fsm,
            commit_stream,
            pending,
            actor_client,
            snapshots,
            key_ring,
            snapshot_threshold,
            restore_workers,
            applied_since_snapshot: 0,
        }
    }

    /// Runs until the commit stream closes or applying hits a local disk failure. A node that
    /// can't persist what it applies must not keep acknowledging writes.
    pub(crate) async fn run(mut self) {
        if let Err(e) = self.recover().await {
            slog::error!(self.logger, "Failed to recover from latest snapshot: {:?}", e);
            return;
        }

        while let Some(committed) = self.commit_stream.recv().await {
            let result = match committed {
                Committed::Entry(entry) => self.handle_entry(entry).await,
                Committed::Snapshot(point) => self.restore_from(point).await,
            };
            if let Err(e) = result {
                slog::error!(self.logger, "State machine halted: {:?}", e);
                return;
            }
        }
        slog::info!(self.logger, "Commit stream closed. Exiting.");
    }

    /// A crash between persisting an installed snapshot and restoring it leaves the marker behind
    /// the snapshot. The log won't replay those entries, so the snapshot has to.
    async fn recover(&mut self) -> Result<(), io::Error> {
        match self.snapshots.latest()? {
            None => Ok(()),
            Some(point) => self.restore_from(point).await,
        }
    }

    async fn handle_entry(&mut self, entry: CommittedEntry) -> Result<(), io::Error> {
        match self.fsm.apply(entry.index, entry.term, &entry.data) {
            Ok(None) => {}
            Ok(Some(applied)) => {
                if let ApplyOutcome::MembershipChanged { added } = &applied.outcome {
                    self.add_peers(added).await;
                }
                self.pending.complete(&applied.request_id, applied.outcome);
            }
            Err(ApplyError::Malformed(index, e)) => {
                slog::error!(self.logger, "Skipped malformed entry {:?}: {}", index, e);
            }
            Err(ApplyError::Io(e)) => return Err(e),
        }

        self.applied_since_snapshot += 1;
        if self.applied_since_snapshot >= self.snapshot_threshold {
            self.take_snapshot(SnapshotPoint {
                term: entry.term,
                index: entry.index,
            })
            .await;
        }
        Ok(())
    }

    async fn take_snapshot(&mut self, point: SnapshotPoint) {
        // Restoring a snapshot makes its membership authoritative, so none exist before formation.
        if !self.fsm.cluster_formed() {
            slog::debug!(self.logger, "Cluster not formed yet. Deferring snapshot at {:?}", point);
            return;
        }

        let snapshots = self.snapshots.clone();
        let entities = self.fsm.entity_store().clone();
        let membership = self.fsm.membership().clone();
        let created = tokio::task::spawn_blocking(move || snapshots.create(point, &entities, &membership)).await;

        match created {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                slog::warn!(self.logger, "Failed to snapshot at {:?}: {:?}", point, e);
                return;
            }
            Err(e) => {
                slog::error!(self.logger, "Snapshot task panicked: {:?}", e);
                return;
            }
        }
        self.applied_since_snapshot = 0;

        let actor_client = match self.actor_client.upgrade() {
            Ok(client) => client,
            Err(_) => return,
        };
        match actor_client.compact_log(CompactLogInput { through: point }).await {
            Ok(output) => slog::debug!(self.logger, "Compacted log through {:?}: {:?}", point, output),
            Err(e) => slog::warn!(self.logger, "Failed to compact log through {:?}: {:?}", point, e),
        }
    }

    async fn restore_from(&mut self, point: SnapshotPoint) -> Result<(), io::Error> {
        let mut reader = self.snapshots.reader(point)?;
        let membership = reader.membership();

        match plan_restore(self.fsm.applied_marker(), point.index.as_u64()) {
            RestorePlan::TopologyOnly => {
                slog::info!(
                    self.logger,
                    "Already applied through snapshot {:?}. Merging topology only.",
                    point
                );
            }
            RestorePlan::Full => {
                slog::info!(self.logger, "Restoring snapshot {:?}", point);
                let logger = self.logger.clone();
                let key_ring = self.key_ring.clone();
                let entities = self.fsm.entity_store().clone();
                let workers = self.restore_workers;
                tokio::task::spawn_blocking(move || {
                    restore_entities(&logger, &mut reader, &key_ring, &entities, workers)
                })
                .await
                .map_err(|e| io::Error::new(ErrorKind::Other, e))??;
                self.fsm.mark_restored(point.index, point.term)?;
            }
        }

        let added = self.fsm.merge_topology(&membership)?;
        self.add_peers(&added).await;
        self.applied_since_snapshot = 0;
        Ok(())
    }

    async fn add_peers(&self, members: &[MemberRecord]) {
        let actor_client = match self.actor_client.upgrade() {
            Ok(client) => client,
            Err(_) => return,
        };
        for member in members {
            let input = AddPeerInput {
                metadata: ReplicaMetadata::from(member),
            };
            if let Err(e) = actor_client.add_peer(input).await {
                slog::warn!(self.logger, "Failed to add peer {}: {:?}", member.node_id, e);
            }
        }
    }
}
