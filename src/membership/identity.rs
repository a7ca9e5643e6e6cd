use crate::crypto::{SecretFile, SecretFileError};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::convert::TryInto;
use std::path::PathBuf;
use tonic::metadata::{MetadataMap, MetadataValue};
use zeroize::Zeroizing;

const IDENTITY_MAGIC: &[u8; 4] = b"SBID";
const IDENTITY_INFO: &[u8] = b"scorebook-node-identity-v1";
const NODE_ID_BYTES: usize = 16;

const NODE_KEY_HEADER: &str = "x-node-key";
const NODE_TS_HEADER: &str = "x-node-ts";
const NODE_SIG_HEADER: &str = "x-node-sig";

/// NodeIdentity is this node's long-lived Ed25519 keypair. Its node id is derived from the public
/// key, so a node id can never be claimed with a different key.
pub struct NodeIdentity {
    signing_key: SigningKey,
    node_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Public key is not valid hex or not a valid Ed25519 point")]
    MalformedKey,
    #[error("Signature is not valid hex or has the wrong length")]
    MalformedSignature,
    #[error("Node id {claimed} doesn't match the presented key ({derived})")]
    NodeIdMismatch { claimed: String, derived: String },
    #[error("Signature doesn't verify")]
    BadSignature,
    #[error("Credentials timestamp is outside the accepted window")]
    StaleTimestamp,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());
        Self::from_seed(&seed)
    }

    fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let node_id = node_id_for_key(&signing_key.verifying_key());
        NodeIdentity { signing_key, node_id }
    }

    /// Loads the keypair sealed under the operator secret, or generates and stores one.
    pub fn load_or_create(path: PathBuf, secret: &[u8]) -> Result<Self, SecretFileError> {
        let file = SecretFile::new(path, IDENTITY_MAGIC, IDENTITY_INFO, secret);
        match file.load()? {
            Some(seed) => {
                let seed: [u8; 32] = seed.as_slice().try_into().map_err(|_| {
                    SecretFileError::Corrupt(file.path().to_path_buf(), "identity seed has bad length".into())
                })?;
                Ok(Self::from_seed(&seed))
            }
            None => {
                let identity = Self::generate();
                file.store(&identity.signing_key.to_bytes())?;
                Ok(identity)
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Fresh credentials for one peer RPC.
    pub(crate) fn peer_credentials(&self) -> PeerCredentials {
        let public_key = self.public_key_hex();
        let timestamp_millis = Utc::now().timestamp_millis();
        let signature = self.sign(PeerCredentials::signing_payload(&public_key, timestamp_millis).as_bytes());

        PeerCredentials {
            public_key,
            timestamp_millis,
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

pub fn node_id_for_key(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..NODE_ID_BYTES])
}

pub fn parse_public_key(key_hex: &str) -> Result<VerifyingKey, IdentityError> {
    let bytes = hex::decode(key_hex).map_err(|_| IdentityError::MalformedKey)?;
    let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| IdentityError::MalformedKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| IdentityError::MalformedKey)
}

/// Checks that `node_id` is the id derived from `key_hex`.
pub fn verify_node_id(node_id: &str, key_hex: &str) -> Result<(), IdentityError> {
    let derived = node_id_for_key(&parse_public_key(key_hex)?);
    if derived != node_id {
        return Err(IdentityError::NodeIdMismatch {
            claimed: node_id.to_string(),
            derived,
        });
    }
    Ok(())
}

/// What a peer presents with every Raft RPC, carried in request metadata.
#[derive(Clone, Debug)]
pub(crate) struct PeerCredentials {
    pub(crate) public_key: String,
    pub(crate) timestamp_millis: i64,
    pub(crate) signature: String,
}

impl PeerCredentials {
    fn signing_payload(public_key: &str, timestamp_millis: i64) -> String {
        format!("scorebook-peer|{}|{}", public_key, timestamp_millis)
    }

    pub(crate) fn attach(&self, metadata: &mut MetadataMap) -> Result<(), IdentityError> {
        let key = MetadataValue::from_str(&self.public_key).map_err(|_| IdentityError::MalformedKey)?;
        let ts = MetadataValue::from_str(&self.timestamp_millis.to_string()).map_err(|_| IdentityError::StaleTimestamp)?;
        let sig = MetadataValue::from_str(&self.signature).map_err(|_| IdentityError::MalformedSignature)?;
        metadata.insert(NODE_KEY_HEADER, key);
        metadata.insert(NODE_TS_HEADER, ts);
        metadata.insert(NODE_SIG_HEADER, sig);
        Ok(())
    }

    /// `None` if any header is missing or unreadable.
    pub(crate) fn from_metadata(metadata: &MetadataMap) -> Option<Self> {
        let header = |name: &str| metadata.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);

        Some(PeerCredentials {
            public_key: header(NODE_KEY_HEADER)?,
            timestamp_millis: header(NODE_TS_HEADER)?.parse().ok()?,
            signature: header(NODE_SIG_HEADER)?,
        })
    }

    /// Verifies the signature and freshness, then returns the node id the key belongs to.
    pub(crate) fn verify(&self, now_millis: i64, max_skew_millis: i64) -> Result<String, IdentityError> {
        if (now_millis - self.timestamp_millis).abs() > max_skew_millis {
            return Err(IdentityError::StaleTimestamp);
        }

        let key = parse_public_key(&self.public_key)?;
        let sig_bytes = hex::decode(&self.signature).map_err(|_| IdentityError::MalformedSignature)?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| IdentityError::MalformedSignature)?;

        key.verify(
            Self::signing_payload(&self.public_key, self.timestamp_millis).as_bytes(),
            &signature,
        )
        .map_err(|_| IdentityError::BadSignature)?;

        Ok(node_id_for_key(&key))
    }
}
