use crate::replica::peer_client::{ConnectError, OutboundCredentials, RaftClient};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

/// ReplicaId is a cluster member's node id: the hash of its public key.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a member can be reached. `sync_port` is only used to redirect clients to the leader.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ReplicaMetadata {
    pub(crate) replica_id: ReplicaId,
    pub(crate) ip_addr: Ipv4Addr,
    pub(crate) raft_port: u16,
    pub(crate) sync_port: u16,
    pub(crate) public_key: String,
}

#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) metadata: ReplicaMetadata,
    pub(crate) client: RaftClient,
}

/// ClusterTracker is the replica's view of who is in the cluster. Members are only ever added.
///
/// A joining node starts without knowing itself as a member. Until its own entry arrives through
/// the log, it never starts elections and it accepts replication from leaders it hasn't met yet.
pub(crate) struct ClusterTracker {
    my_metadata: ReplicaMetadata,
    peers: HashMap<ReplicaId, Peer>,
    credentials: OutboundCredentials,
    joining: bool,
}

impl ClusterTracker {
    pub(crate) fn new(my_metadata: ReplicaMetadata, credentials: OutboundCredentials, joining: bool) -> Self {
        ClusterTracker {
            my_metadata,
            peers: HashMap::new(),
            credentials,
            joining,
        }
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_metadata.replica_id
    }

    pub(crate) fn is_joining(&self) -> bool {
        self.joining
    }

    /// Adds or updates a member. Returns true if a new peer was added.
    pub(crate) fn add_member(&mut self, metadata: ReplicaMetadata) -> Result<bool, ConnectError> {
        if metadata.replica_id == self.my_metadata.replica_id {
            self.joining = false;
            self.my_metadata = metadata;
            return Ok(false);
        }

        if let Some(existing) = self.peers.get(&metadata.replica_id) {
            if existing.metadata == metadata {
                return Ok(false);
            }
        }

        let client = RaftClient::new(&metadata, &self.credentials)?;
        let is_new = self
            .peers
            .insert(metadata.replica_id.clone(), Peer { metadata, client })
            .is_none();
        Ok(is_new)
    }

    pub(crate) fn metadata(&self, replica_id: &ReplicaId) -> Option<&ReplicaMetadata> {
        if *replica_id == self.my_metadata.replica_id {
            Some(&self.my_metadata)
        } else {
            self.peers.get(replica_id).map(|p| &p.metadata)
        }
    }

    pub(crate) fn peer(&self, replica_id: &ReplicaId) -> Option<&Peer> {
        self.peers.get(replica_id)
    }

    pub(crate) fn contains_member(&self, replica_id: &ReplicaId) -> bool {
        *replica_id == self.my_metadata.replica_id || self.peers.contains_key(replica_id)
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.peers.len() + 1
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }
}
