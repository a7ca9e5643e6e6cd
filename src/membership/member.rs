use crate::grpc::ProtoNodeInfo;
use crate::membership::identity::{verify_node_id, IdentityError};
use crate::replica::{ReplicaId, ReplicaMetadata};
use crate::storage::StableStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::io::{self, ErrorKind};
use std::net::Ipv4Addr;
use std::sync::Arc;

const MEMBERSHIP_KEY: &str = "membership";

/// One authorized cluster member: its public key and the addresses it advertises.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub node_id: String,
    pub public_key: String,
    pub ip_addr: Ipv4Addr,
    pub raft_port: u16,
    pub sync_port: u16,
}

impl MemberRecord {
    pub fn validate(&self) -> Result<(), IdentityError> {
        verify_node_id(&self.node_id, &self.public_key)
    }
}

/// Membership is the committed set of members, keyed by node id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Membership {
    members: BTreeMap<String, MemberRecord>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members<I: IntoIterator<Item = MemberRecord>>(members: I) -> Self {
        let mut membership = Membership::new();
        for member in members {
            membership.add(member);
        }
        membership
    }

    /// Returns true if `member` is new or changed.
    pub fn add(&mut self, member: MemberRecord) -> bool {
        match self.members.get(&member.node_id) {
            Some(existing) if *existing == member => false,
            _ => {
                self.members.insert(member.node_id.clone(), member);
                true
            }
        }
    }

    /// Union with `other`. Returns the records that were new or changed.
    pub fn merge(&mut self, other: &Membership) -> Vec<MemberRecord> {
        other
            .members()
            .filter(|m| self.add((*m).clone()))
            .cloned()
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<&MemberRecord> {
        self.members.get(node_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.members.values().collect::<Vec<_>>())
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let members: Vec<MemberRecord> = serde_json::from_slice(bytes)?;
        Ok(Self::from_members(members))
    }
}

/// Persists the committed membership next to term and vote.
#[derive(Clone)]
pub struct MembershipStore {
    store: Arc<dyn StableStore>,
}

impl MembershipStore {
    pub fn new(store: Arc<dyn StableStore>) -> Self {
        MembershipStore { store }
    }

    pub fn load(&self) -> Result<Membership, io::Error> {
        match self.store.get(MEMBERSHIP_KEY)? {
            None => Ok(Membership::new()),
            Some(bytes) => {
                Membership::from_json_bytes(&bytes).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
            }
        }
    }

    pub fn save(&self, membership: &Membership) -> Result<(), io::Error> {
        let bytes = membership
            .to_json_bytes()
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        self.store.put(MEMBERSHIP_KEY, &bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidNodeInfo {
    #[error("Invalid ip address {0:?}")]
    IpAddr(String),
    #[error("Port {0} out of range")]
    Port(u32),
    #[error("Invalid identity: {0}")]
    Identity(#[from] IdentityError),
}

// ------- Conversions --------

impl From<&MemberRecord> for ProtoNodeInfo {
    fn from(member: &MemberRecord) -> Self {
        ProtoNodeInfo {
            node_id: member.node_id.clone(),
            public_key: member.public_key.clone(),
            ip_addr: member.ip_addr.to_string(),
            raft_port: u32::from(member.raft_port),
            sync_port: u32::from(member.sync_port),
        }
    }
}

impl TryFrom<ProtoNodeInfo> for MemberRecord {
    type Error = InvalidNodeInfo;

    fn try_from(info: ProtoNodeInfo) -> Result<Self, Self::Error> {
        let ip_addr = info
            .ip_addr
            .parse()
            .map_err(|_| InvalidNodeInfo::IpAddr(info.ip_addr.clone()))?;
        let port = |p: u32| u16::try_from(p).map_err(|_| InvalidNodeInfo::Port(p));

        let record = MemberRecord {
            node_id: info.node_id,
            public_key: info.public_key,
            ip_addr,
            raft_port: port(info.raft_port)?,
            sync_port: port(info.sync_port)?,
        };
        record.validate()?;
        Ok(record)
    }
}

impl From<&MemberRecord> for ReplicaMetadata {
    fn from(member: &MemberRecord) -> Self {
        ReplicaMetadata {
            replica_id: ReplicaId::new(member.node_id.clone()),
            ip_addr: member.ip_addr,
            raft_port: member.raft_port,
            sync_port: member.sync_port,
            public_key: member.public_key.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::membership::NodeIdentity;

    pub(crate) fn member(identity: &NodeIdentity, port: u16) -> MemberRecord {
        MemberRecord {
            node_id: identity.node_id().to_string(),
            public_key: identity.public_key_hex(),
            ip_addr: Ipv4Addr::LOCALHOST,
            raft_port: port,
            sync_port: port + 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::member;
    use super::*;
    use crate::membership::NodeIdentity;
    use crate::storage::MemoryStableStore;

    #[test]
    fn add_and_merge_report_changes() {
        let a = member(&NodeIdentity::generate(), 3000);
        let b = member(&NodeIdentity::generate(), 3001);

        let mut membership = Membership::new();
        assert!(membership.add(a.clone()));
        assert!(!membership.add(a.clone()));

        let other = Membership::from_members(vec![a, b.clone()]);
        assert_eq!(membership.merge(&other), vec![b]);
        assert_eq!(membership.len(), 2);
    }

    #[test]
    fn record_validation_checks_node_id() {
        let mut record = member(&NodeIdentity::generate(), 3000);
        assert!(record.validate().is_ok());

        record.node_id = "00".repeat(16);
        assert!(record.validate().is_err());
    }

    #[test]
    fn node_info_is_validated() {
        let record = member(&NodeIdentity::generate(), 3000);
        let info = ProtoNodeInfo::from(&record);
        assert_eq!(MemberRecord::try_from(info.clone()).unwrap(), record);

        let mut bad_port = info.clone();
        bad_port.raft_port = 70_000;
        assert!(matches!(MemberRecord::try_from(bad_port), Err(InvalidNodeInfo::Port(70_000))));

        let mut forged = info;
        forged.public_key = NodeIdentity::generate().public_key_hex();
        assert!(matches!(MemberRecord::try_from(forged), Err(InvalidNodeInfo::Identity(_))));
    }

    #[test]
    fn store_round_trip() {
        let store = MembershipStore::new(Arc::new(MemoryStableStore::new()));
        assert!(store.load().unwrap().is_empty());

        let membership = Membership::from_members(vec![member(&NodeIdentity::generate(), 3000)]);
        store.save(&membership).unwrap();
        assert_eq!(store.load().unwrap(), membership);
    }
}
