use crate::action::{EntityId, EntityRecord};
use crate::actor::{ActorClient, ReplicaActor};
use crate::api::event_bus::NodeEventListener;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::write_handle::WriteHandle;
use crate::commitlog::{Index, SegmentedDiskLog, StorageConfig};
use crate::crypto::{
    KeyFile, KeyGarbageCollector, KeyReferences, KeyRingHandle, KeyRotation, Reseal, RotationReport, SecretFileError,
};
use crate::fsm::{EntityEvent, EntityFsm, FsmDriver, PendingApplies, Proposer};
use crate::membership::{
    discover_bootstrap_members, spawn_cluster_formation, MemberRecord, MembershipStore, NodeIdentity, TrustStore,
};
use crate::replica::{self, OutboundCredentials, ReplicaMetadata, ReplicaStorage};
use crate::server::{self, ClientServices, MembershipServer, NodeTls, PeerAuthenticator, RaftServer, SyncServer};
use crate::snapshot::SnapshotStore;
use crate::storage::{AppliedIndexStore, EncryptedLog, EncryptedStableStore, EntityStore, FileStableStore, KeyScan};
use std::convert::TryFrom;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use zeroize::Zeroizing;

const ACTOR_QUEUE_SIZE: usize = 64;
const ENTITY_EVENT_BUFFER: usize = 1024;
/// Node identity file inside the data directory.
pub const IDENTITY_FILE: &str = "identity.sealed";

pub struct ScorebookNodeConfig {
    // A directory where we can create files and sub-directories for every store the node keeps.
    pub data_directory: PathBuf,
    pub ip_addr: Ipv4Addr,
    pub raft_port: u16,
    pub sync_port: u16,
    /// Sync-port addresses of the founding members. Empty for a single node cluster.
    pub bootstrap: Vec<SocketAddr>,
    pub join: bool,
    pub cluster_secret: String,
    /// Unlocks the key ring and the node identity.
    pub key_secret: Zeroizing<Vec<u8>>,
    /// Certificate for both ports, issued by the cluster CA for this node's id.
    pub tls: NodeTls,
    pub bootstrap_attempts: u32,
    pub max_clock_skew: Duration,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum StartNodeError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("Failed to unlock key ring: {0}")]
    KeyRing(SecretFileError),
    #[error("Failed to unlock node identity: {0}")]
    Identity(SecretFileError),
    #[error("Storage initialization failure: {0}")]
    Storage(#[from] io::Error),
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("Failed to create replica: {0}")]
    Replica(String),
}

/// A running node. Dropping it leaves the background tasks running; call `shutdown()` to stop
/// serving.
pub struct ScorebookNode {
    me: MemberRecord,
    event_listener: NodeEventListener,
    entity_events: broadcast::Sender<EntityEvent>,
    write_handle: WriteHandle,
    entities: Arc<EntityStore>,
    server_shutdown_handle: server::RpcServerShutdownHandle,
    key_rotation: Arc<KeyRotation>,
    key_rotation_stop: Option<oneshot::Sender<()>>,
    key_gc_stop: oneshot::Sender<()>,
}

impl ScorebookNode {
    pub fn node_id(&self) -> &str {
        &self.me.node_id
    }

    pub fn public_key(&self) -> &str {
        &self.me.public_key
    }

    pub fn sync_addr(&self) -> SocketAddr {
        SocketAddr::new(self.me.ip_addr.into(), self.me.sync_port)
    }

    pub fn event_listener(&self) -> NodeEventListener {
        self.event_listener.clone()
    }

    /// Every write this node applies, in apply order.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.entity_events.subscribe()
    }

    pub fn write_handle(&self) -> WriteHandle {
        self.write_handle.clone()
    }

    /// Reads the entity as this node last applied it.
    pub fn read_entity(&self, id: &EntityId) -> Result<Option<EntityRecord>, io::Error> {
        self.entities.load(id)
    }

    /// Rotates the at-rest key now and re-seals the entity and stable stores under the new one.
    /// Older keys stay in the ring until the key GC finds nothing left that references them.
    pub async fn rotate_keys(&self) -> Result<RotationReport, io::Error> {
        let rotation = self.key_rotation.clone();
        tokio::task::spawn_blocking(move || rotation.rotate_now())
            .await
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?
    }

    pub fn shutdown(self) {
        if let Some(stop) = self.key_rotation_stop {
            let _ = stop.send(());
        }
        let _ = self.key_gc_stop.send(());
        self.server_shutdown_handle.shutdown();
    }
}

pub async fn start_node(config: ScorebookNodeConfig) -> Result<ScorebookNode, StartNodeError> {
    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| StartNodeError::IllegalOptions(e.to_string()))?;
    let dir = config.data_directory;
    std::fs::create_dir_all(&dir)?;

    let key_file = KeyFile::new(dir.join("keyring.sealed"), &config.key_secret);
    let key_ring = KeyRingHandle::new(key_file.load_or_create().map_err(StartNodeError::KeyRing)?, Some(key_file));
    let identity = Arc::new(
        NodeIdentity::load_or_create(dir.join(IDENTITY_FILE), &config.key_secret)
            .map_err(StartNodeError::Identity)?,
    );

    let me = MemberRecord {
        node_id: identity.node_id().to_string(),
        public_key: identity.public_key_hex(),
        ip_addr: config.ip_addr,
        raft_port: config.raft_port,
        sync_port: config.sync_port,
    };
    let root_logger = config.info_logger.new(slog::o!("NodeId" => me.node_id.clone()));
    slog::info!(root_logger, "Starting node with key ring {:?}", key_ring.active_key_id());

    // ------- Stores --------

    let stable_store = Arc::new(EncryptedStableStore::new(
        FileStableStore::open(dir.join("stable"))?,
        key_ring.clone(),
    ));
    let trust = Arc::new(TrustStore::open(stable_store.clone())?);
    let membership_store = MembershipStore::new(stable_store.clone());
    let persisted_membership = membership_store.load()?;
    let entities = Arc::new(EntityStore::open(dir.join("entities"), key_ring.clone())?);
    let applied = Arc::new(AppliedIndexStore::open(dir.join("applied.json"))?);
    let snapshots = Arc::new(SnapshotStore::open(
        root_logger.clone(),
        dir.join("snapshots"),
        key_ring.clone(),
        options.retained_snapshots,
    )?);
    let log_directory = dir.join("log");
    let commit_log = EncryptedLog::new(
        SegmentedDiskLog::open(StorageConfig {
            directory: log_directory.clone(),
        })?,
        key_ring.clone(),
    );

    // ------- Client facing services --------

    let (entity_events, _) = broadcast::channel(ENTITY_EVENT_BUFFER);
    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);
    let pending = PendingApplies::new();
    let proposer = Proposer::new(
        root_logger.new(slog::o!("Task" => "Proposer")),
        actor_client.clone(),
        pending.clone(),
        options.max_in_flight_writes,
        options.rate_limit_retry_after,
        options.write_apply_timeout,
    );

    let mut server_shutdown_handle = server::shutdown_handle();
    let client_services = ClientServices::new(
        root_logger.clone(),
        MembershipServer::new(
            root_logger.new(slog::o!("Task" => "MembershipServer")),
            me.clone(),
            config.cluster_secret.clone(),
            proposer.clone(),
        ),
        SyncServer::new(
            root_logger.new(slog::o!("Task" => "SyncServer")),
            me.node_id.clone(),
            entities.clone(),
            proposer.clone(),
            entity_events.clone(),
            config.tls.clone(),
        ),
    );
    let sync_addr = SocketAddr::new(me.ip_addr.into(), me.sync_port);
    tokio::spawn(client_services.run(sync_addr, config.tls.sync_server(), server_shutdown_handle.signal()));

    // ------- Membership --------

    let founding_members = if !persisted_membership.is_empty() {
        slog::info!(root_logger, "Recovered membership of {} nodes", persisted_membership.len());
        None
    } else if config.join {
        slog::info!(root_logger, "Waiting to be added to an existing cluster");
        None
    } else {
        let members = discover_bootstrap_members(
            &root_logger,
            &config.bootstrap,
            &me,
            &config.cluster_secret,
            config.tls.cluster(),
            &trust,
            config.bootstrap_attempts,
        )
        .await
        .map_err(|e| StartNodeError::Bootstrap(e.to_string()))?;
        Some(members)
    };
    let known_members: Vec<ReplicaMetadata> = match &founding_members {
        Some(members) => members.iter().map(ReplicaMetadata::from).collect(),
        None => persisted_membership.members().map(ReplicaMetadata::from).collect(),
    };

    // ------- Replica --------

    let snapshot_point = snapshots.latest()?;
    let replica_storage = ReplicaStorage {
        commit_log,
        local_state_store: stable_store.clone(),
        snapshot_point,
        applied_index: Index::from_u64_opt(applied.get().index),
    };
    let (replica, commit_stream, election_state_change_listener) = replica::create_replica(
        root_logger.clone(),
        ReplicaMetadata::from(&me),
        OutboundCredentials {
            identity,
            tls: config.tls.clone(),
        },
        known_members,
        config.join,
        replica_storage,
        snapshots.clone(),
        actor_client.weak(),
        options.leader_heartbeat_duration,
        options.follower_min_timeout,
        options.follower_max_timeout,
        options.leader_append_entries_timeout,
    )
    .map_err(|e| StartNodeError::Replica(e.to_string()))?;

    let replica_actor = ReplicaActor::new(root_logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    let raft_server = RaftServer::new(
        root_logger.new(slog::o!("Task" => "RaftServer")),
        actor_client.weak(),
        PeerAuthenticator::new(trust.clone(), config.max_clock_skew),
        snapshots.clone(),
    );
    let raft_addr = SocketAddr::new(me.ip_addr.into(), me.raft_port);
    tokio::spawn(raft_server.run(raft_addr, config.tls.raft_server(), server_shutdown_handle.signal()));

    // ------- State machine --------

    let fsm = EntityFsm::new(
        root_logger.new(slog::o!("Task" => "EntityFsm")),
        entities.clone(),
        applied,
        membership_store,
        trust.clone(),
        entity_events.clone(),
    )?;
    let fsm_driver = FsmDriver::new(
        root_logger.clone(),
        fsm,
        commit_stream,
        pending,
        actor_client.weak(),
        snapshots.clone(),
        key_ring.clone(),
        options.snapshot_threshold,
        options.restore_workers,
    );
    tokio::spawn(fsm_driver.run());

    if let Some(members) = founding_members {
        spawn_cluster_formation(
            root_logger.clone(),
            election_state_change_listener.clone(),
            trust,
            proposer.clone(),
            members,
        );
    }

    // ------- Key rotation and GC --------

    let resealable: Vec<Arc<dyn Reseal>> = vec![entities.clone(), stable_store.clone()];
    let key_rotation = Arc::new(KeyRotation::new(root_logger.clone(), key_ring.clone(), resealable));
    let key_rotation_stop = options.key_rotation_interval.map(|interval| {
        let (stop, stop_rx) = oneshot::channel();
        key_rotation.clone().spawn(interval, stop_rx);
        stop
    });

    let references: Vec<Arc<dyn KeyReferences>> = vec![
        entities.clone(),
        snapshots,
        stable_store,
        Arc::new(KeyScan::lowest_named(log_directory, "log")),
    ];
    let (key_gc_stop, key_gc_stop_rx) = oneshot::channel();
    KeyGarbageCollector::new(root_logger.clone(), key_ring, references).spawn(options.key_gc_interval, key_gc_stop_rx);

    Ok(ScorebookNode {
        me,
        event_listener: NodeEventListener::new(election_state_change_listener),
        entity_events,
        write_handle: WriteHandle::new(proposer),
        entities,
        server_shutdown_handle,
        key_rotation,
        key_rotation_stop,
        key_gc_stop,
    })
}
