use crate::membership::member::Membership;
use crate::storage::StableStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::sync::{Arc, Mutex};

const TRUST_KEY: &str = "trust";

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
enum TrustMode {
    /// No authoritative membership yet. The first key presented for a node id is pinned.
    Bootstrap,
    /// Only keys in the committed membership are accepted.
    Enforcing,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TrustState {
    mode: TrustMode,
    /// node id -> public key hex
    keys: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TrustError {
    #[error("Node {0} is not an authorized cluster member")]
    UnknownNode(String),
    #[error("Node {0} presented a key other than the one it is trusted with")]
    KeyMismatch(String),
}

/// TrustStore decides which peers may talk Raft to this node. It persists through the stable
/// store so that once membership is enforced it stays enforced across restarts.
pub struct TrustStore {
    store: Arc<dyn StableStore>,
    state: Mutex<TrustState>,
}

impl TrustStore {
    pub fn open(store: Arc<dyn StableStore>) -> Result<Self, io::Error> {
        let state = match store.get(TRUST_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?,
            None => TrustState {
                mode: TrustMode::Bootstrap,
                keys: BTreeMap::new(),
            },
        };

        Ok(TrustStore {
            store,
            state: Mutex::new(state),
        })
    }

    pub fn is_enforcing(&self) -> bool {
        self.state.lock().expect("TrustStore lock poisoned").mode == TrustMode::Enforcing
    }

    /// Checks `public_key` for `node_id`. While bootstrapping, an unseen node id is pinned to the
    /// key it first presents.
    pub fn check(&self, node_id: &str, public_key: &str) -> Result<(), io::Error> {
        let mut state = self.state.lock().expect("TrustStore lock poisoned");

        match state.keys.get(node_id) {
            Some(trusted) if trusted == public_key => Ok(()),
            Some(_) => Err(trust_error(TrustError::KeyMismatch(node_id.to_string()))),
            None => match state.mode {
                TrustMode::Enforcing => Err(trust_error(TrustError::UnknownNode(node_id.to_string()))),
                TrustMode::Bootstrap => {
                    state.keys.insert(node_id.to_string(), public_key.to_string());
                    self.persist(&state)
                }
            },
        }
    }

    /// Pins a key ahead of first contact, e.g. from configured bootstrap peers.
    pub fn pin(&self, node_id: &str, public_key: &str) -> Result<(), io::Error> {
        let mut state = self.state.lock().expect("TrustStore lock poisoned");
        if state.keys.get(node_id).map(String::as_str) == Some(public_key) {
            return Ok(());
        }
        state.keys.insert(node_id.to_string(), public_key.to_string());
        self.persist(&state)
    }

    /// Replaces the trusted set with the committed membership and stops accepting strangers.
    pub fn enforce_membership(&self, membership: &Membership) -> Result<(), io::Error> {
        let mut state = self.state.lock().expect("TrustStore lock poisoned");
        state.mode = TrustMode::Enforcing;
        state.keys = membership
            .members()
            .map(|m| (m.node_id.clone(), m.public_key.clone()))
            .collect();
        self.persist(&state)
    }

    fn persist(&self, state: &TrustState) -> Result<(), io::Error> {
        let bytes = serde_json::to_vec(state).map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        self.store.put(TRUST_KEY, &bytes)
    }
}

fn trust_error(e: TrustError) -> io::Error {
    io::Error::new(ErrorKind::PermissionDenied, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::member::test_support::member;
    use crate::membership::NodeIdentity;
    use crate::storage::MemoryStableStore;

    #[test]
    fn bootstrap_pins_first_key() {
        let trust = TrustStore::open(Arc::new(MemoryStableStore::new())).unwrap();
        let node = NodeIdentity::generate();
        let impostor = NodeIdentity::generate();

        trust.check(node.node_id(), &node.public_key_hex()).unwrap();
        trust.check(node.node_id(), &node.public_key_hex()).unwrap();
        let err = trust.check(node.node_id(), &impostor.public_key_hex()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn enforcing_survives_restart() {
        let store: Arc<dyn StableStore> = Arc::new(MemoryStableStore::new());
        let member_node = NodeIdentity::generate();
        let stranger = NodeIdentity::generate();

        let trust = TrustStore::open(store.clone()).unwrap();
        trust
            .enforce_membership(&Membership::from_members(vec![member(&member_node, 3000)]))
            .unwrap();
        drop(trust);

        let reopened = TrustStore::open(store).unwrap();
        assert!(reopened.is_enforcing());
        reopened
            .check(member_node.node_id(), &member_node.public_key_hex())
            .unwrap();
        assert!(reopened
            .check(stranger.node_id(), &stranger.public_key_hex())
            .is_err());
    }
}
