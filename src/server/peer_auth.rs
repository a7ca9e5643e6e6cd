use crate::membership::{PeerCredentials, TrustStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// PeerAuthenticator checks the signed credentials every Raft RPC carries against the trust
/// store. The node id a request claims must be the one its key hashes to.
#[derive(Clone)]
pub(crate) struct PeerAuthenticator {
    trust: Arc<TrustStore>,
    max_clock_skew: Duration,
}

impl PeerAuthenticator {
    pub(crate) fn new(trust: Arc<TrustStore>, max_clock_skew: Duration) -> Self {
        PeerAuthenticator { trust, max_clock_skew }
    }

    pub(crate) fn authenticate(&self, metadata: &MetadataMap, claimed_node_id: &str) -> Result<(), Status> {
        let credentials =
            PeerCredentials::from_metadata(metadata).ok_or_else(|| Status::unauthenticated("Missing peer credentials"))?;

        let node_id = credentials
            .verify(Utc::now().timestamp_millis(), self.max_clock_skew.as_millis() as i64)
            .map_err(|e| Status::unauthenticated(e.to_string()))?;
        if node_id != claimed_node_id {
            return Err(Status::unauthenticated(format!(
                "Credentials belong to {}, request claims {}",
                node_id, claimed_node_id
            )));
        }

        self.trust
            .check(&node_id, &credentials.public_key)
            .map_err(|e| Status::unauthenticated(e.to_string()))
    }
}
