use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::replica::election::{ElectionConfig, ElectionState};
use crate::replica::local_state::DurableLocalState;
use crate::replica::peer_client::{ConnectError, OutboundCredentials};
use crate::replica::{
    write_ahead_log, ClusterTracker, CommitStream, ElectionStateChangeListener, Replica, ReplicaMetadata,
    SnapshotPoint, SnapshotSource, WriteAheadLogEntry,
};
use crate::storage::StableStore;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Everything the replica recovers from disk on startup.
pub(crate) struct ReplicaStorage<L> {
    pub(crate) commit_log: L,
    // Term and vote.
    pub(crate) local_state_store: Arc<dyn StableStore>,
    pub(crate) snapshot_point: Option<SnapshotPoint>,
    pub(crate) applied_index: Option<Index>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CreateReplicaError {
    #[error("Failed to recover replica state: {0}")]
    Recovery(#[from] io::Error),
    #[error("Invalid cluster member: {0}")]
    InvalidMember(#[from] ConnectError),
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn create_replica<L>(
    logger: slog::Logger,
    my_metadata: ReplicaMetadata,
    credentials: OutboundCredentials,
    // Members already known from persisted or bootstrap membership. May include ourselves.
    cluster_members: Vec<ReplicaMetadata>,
    joining: bool,
    storage: ReplicaStorage<L>,
    snapshot_source: Arc<dyn SnapshotSource>,
    actor_client: WeakActorClient,
    leader_heartbeat_duration: Duration,
    follower_min_timeout: Duration,
    follower_max_timeout: Duration,
    append_entries_timeout: Duration,
) -> Result<(Replica<L>, CommitStream, ElectionStateChangeListener), CreateReplicaError>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    let my_replica_id = my_metadata.replica_id.clone();
    let logger = logger.new(slog::o!("ReplicaId" => my_replica_id.clone().into_inner()));

    let mut cluster_tracker = ClusterTracker::new(my_metadata, credentials, joining);
    for member in cluster_members {
        cluster_tracker.add_member(member)?;
    }

    let (election_state, election_state_change_listener) = ElectionState::new_follower(
        ElectionConfig {
            my_replica_id: my_replica_id.clone(),
            leader_heartbeat_duration,
            follower_min_timeout,
            follower_max_timeout,
        },
        actor_client.clone(),
    );

    let (write_ahead_log, commit_stream) = write_ahead_log::wired(
        logger.clone(),
        storage.commit_log,
        storage.snapshot_point,
        storage.applied_index,
    )?;

    let local_state = Box::new(DurableLocalState::open(storage.local_state_store, my_replica_id.clone())?);

    let replica = Replica::new(
        logger,
        my_replica_id,
        cluster_tracker,
        local_state,
        election_state,
        write_ahead_log,
        snapshot_source,
        actor_client,
        append_entries_timeout,
    );

    Ok((replica, commit_stream, election_state_change_listener))
}
