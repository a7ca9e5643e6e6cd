use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::{fmt, io};
use zeroize::Zeroizing;

/// Byte layout of a sealed payload:
///
/// ```text
/// +-----+----------------+--------------------+---------------------------...-+
/// | Vrs |  KeyId (4, BE) |    Nonce (12)      |  Ciphertext + tag (16)    ... |
/// +-----+----------------+--------------------+---------------------------...-+
/// ```
///
/// The 5 byte header is authenticated as associated data, so a record can't be relabeled with a
/// different key id.
const SEALED_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 5;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct KeyId(u32);

impl KeyId {
    pub fn new(id: u32) -> Self {
        KeyId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    fn next(&self) -> KeyId {
        KeyId(self.0 + 1)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

/// Tampered ciphertext, or no retained key opens it.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("Sealed payload is truncated or has an unknown format")]
    Malformed,
    #[error("No retained key authenticates the payload (header names {0:?})")]
    Unauthenticated(KeyId),
}

impl From<IntegrityError> for io::Error {
    fn from(e: IntegrityError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Key id named in the header of a sealed payload, without decrypting it.
pub fn sealed_key_id(sealed: &[u8]) -> Option<KeyId> {
    if sealed.len() < HEADER_LEN || sealed[0] != SEALED_FORMAT_VERSION {
        return None;
    }
    let mut id = [0u8; 4];
    id.copy_from_slice(&sealed[1..HEADER_LEN]);
    Some(KeyId(u32::from_be_bytes(id)))
}

pub(crate) struct DataKey {
    pub(crate) id: KeyId,
    pub(crate) material: Zeroizing<[u8; 32]>,
    pub(crate) created_at: DateTime<Utc>,
}

impl DataKey {
    fn generate(id: KeyId) -> Self {
        let mut material = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(material.as_mut());
        DataKey {
            id,
            material,
            created_at: Utc::now(),
        }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.material.as_ref()))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, io::Error> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + plaintext.len() + TAG_LEN);
        out.push(SEALED_FORMAT_VERSION);
        out.extend_from_slice(&self.id.0.to_be_bytes());

        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &out[..HEADER_LEN],
                },
            )
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "Encryption failed"))?;

        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        let header = &sealed[..HEADER_LEN];
        let nonce = Nonce::from_slice(&sealed[HEADER_LEN..HEADER_LEN + NONCE_LEN]);
        let ciphertext = &sealed[HEADER_LEN + NONCE_LEN..];

        self.cipher()
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .ok()
    }
}

/// KeyRing holds one active key used for every new encryption, plus retired keys that are only
/// used to decrypt. Key ids increase monotonically.
pub struct KeyRing {
    active: KeyId,
    keys: BTreeMap<KeyId, DataKey>,
}

impl KeyRing {
    pub fn generate() -> Self {
        let first = KeyId::new(1);
        let mut keys = BTreeMap::new();
        keys.insert(first, DataKey::generate(first));
        KeyRing { active: first, keys }
    }

    pub(crate) fn from_parts(active: KeyId, keys: Vec<DataKey>) -> Result<Self, io::Error> {
        let keys: BTreeMap<KeyId, DataKey> = keys.into_iter().map(|k| (k.id, k)).collect();
        if !keys.contains_key(&active) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Key ring's active key is missing",
            ));
        }
        Ok(KeyRing { active, keys })
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &DataKey> {
        self.keys.values()
    }

    pub fn active_key_id(&self) -> KeyId {
        self.active
    }

    pub fn key_ids(&self) -> Vec<KeyId> {
        self.keys.keys().copied().collect()
    }

    /// Adds a new key and makes it active. The previous one is retired, not erased.
    pub fn rotate(&mut self) -> KeyId {
        let newest = self.keys.keys().next_back().copied().unwrap_or(self.active);
        let id = newest.next();
        self.keys.insert(id, DataKey::generate(id));
        self.active = id;
        id
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, io::Error> {
        match self.keys.get(&self.active) {
            Some(key) => key.seal(plaintext),
            None => Err(io::Error::new(io::ErrorKind::Other, "Active key missing from key ring")),
        }
    }

    /// Tries the key named in the header first, then the active key, then every retired key from
    /// newest to oldest.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, IntegrityError> {
        let named = sealed_key_id(sealed).ok_or(IntegrityError::Malformed)?;
        if sealed.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
            return Err(IntegrityError::Malformed);
        }

        let mut candidates: Vec<&DataKey> = Vec::with_capacity(self.keys.len());
        if let Some(key) = self.keys.get(&named) {
            candidates.push(key);
        }
        if let Some(key) = self.keys.get(&self.active) {
            if key.id != named {
                candidates.push(key);
            }
        }
        for key in self.keys.values().rev() {
            if key.id != named && key.id != self.active {
                candidates.push(key);
            }
        }

        for key in candidates {
            if let Some(plaintext) = key.open(sealed) {
                return Ok(plaintext);
            }
        }

        Err(IntegrityError::Unauthenticated(named))
    }

    /// Erases every key older than `horizon`, except the active key and the two newest keys.
    /// Returns the erased ids.
    pub fn erase_below(&mut self, horizon: KeyId) -> Vec<KeyId> {
        let protected: Vec<KeyId> = self.keys.keys().rev().take(2).copied().collect();

        let doomed: Vec<KeyId> = self
            .keys
            .keys()
            .copied()
            .filter(|id| *id < horizon && *id != self.active && !protected.contains(id))
            .collect();

        for id in doomed.iter() {
            // Dropping the DataKey zeroizes its material.
            self.keys.remove(id);
        }
        doomed
    }
}

/// Shared handle to the node's key ring. Every encrypting store holds one, and rotation or GC
/// through any handle is seen by all of them. Changes are persisted through the key file when one
/// is attached.
#[derive(Clone)]
pub struct KeyRingHandle {
    ring: Arc<RwLock<KeyRing>>,
    file: Option<Arc<crate::crypto::KeyFile>>,
}

impl KeyRingHandle {
    pub fn new(ring: KeyRing, file: Option<crate::crypto::KeyFile>) -> Self {
        KeyRingHandle {
            ring: Arc::new(RwLock::new(ring)),
            file: file.map(Arc::new),
        }
    }

    /// For tests and in-memory nodes.
    pub fn ephemeral() -> Self {
        Self::new(KeyRing::generate(), None)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, io::Error> {
        self.ring.read().expect("KeyRing lock poisoned").seal(plaintext)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, IntegrityError> {
        self.ring.read().expect("KeyRing lock poisoned").open(sealed)
    }

    pub fn active_key_id(&self) -> KeyId {
        self.ring.read().expect("KeyRing lock poisoned").active_key_id()
    }

    pub fn key_ids(&self) -> Vec<KeyId> {
        self.ring.read().expect("KeyRing lock poisoned").key_ids()
    }

    pub fn rotate(&self) -> Result<KeyId, io::Error> {
        let mut ring = self.ring.write().expect("KeyRing lock poisoned");
        let id = ring.rotate();
        self.persist(&ring)?;
        Ok(id)
    }

    pub fn erase_below(&self, horizon: KeyId) -> Result<Vec<KeyId>, io::Error> {
        let mut ring = self.ring.write().expect("KeyRing lock poisoned");
        let erased = ring.erase_below(horizon);
        if !erased.is_empty() {
            self.persist(&ring)?;
        }
        Ok(erased)
    }

    fn persist(&self, ring: &KeyRing) -> Result<(), io::Error> {
        match &self.file {
            None => Ok(()),
            Some(file) => file.store(ring).map_err(io::Error::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_with_active_and_retained_keys() {
        let mut ring = KeyRing::generate();
        let old = ring.seal(b"before rotation").unwrap();

        ring.rotate();
        let new = ring.seal(b"after rotation").unwrap();

        assert_eq!(ring.open(&old).unwrap(), b"before rotation");
        assert_eq!(ring.open(&new).unwrap(), b"after rotation");
        assert_eq!(sealed_key_id(&old), Some(KeyId::new(1)));
        assert_eq!(sealed_key_id(&new), Some(KeyId::new(2)));
    }

    #[test]
    fn tampering_is_an_integrity_error() {
        let ring = KeyRing::generate();
        let mut sealed = ring.seal(b"score 3-2").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(ring.open(&sealed), Err(IntegrityError::Unauthenticated(_))));
        assert!(matches!(ring.open(&sealed[..4]), Err(IntegrityError::Malformed)));
    }

    #[test]
    fn relabeled_header_fails_every_key() {
        let mut ring = KeyRing::generate();
        let sealed = ring.seal(b"payload").unwrap();
        ring.rotate();

        // Header is authenticated, so a relabeled record fails every key.
        let mut relabeled = sealed.clone();
        relabeled[4] = 2;
        assert!(ring.open(&relabeled).is_err());
        assert!(ring.open(&sealed).is_ok());
    }

    #[test]
    fn foreign_ring_cannot_open() {
        let ours = KeyRing::generate();
        let theirs = KeyRing::generate();
        let sealed = theirs.seal(b"secret").unwrap();

        assert!(ours.open(&sealed).is_err());
    }

    #[test]
    fn erase_keeps_active_and_two_newest() {
        let mut ring = KeyRing::generate();
        for _ in 0..4 {
            ring.rotate();
        }
        assert_eq!(ring.active_key_id(), KeyId::new(5));

        let erased = ring.erase_below(KeyId::new(10));
        assert_eq!(erased, vec![KeyId::new(1), KeyId::new(2), KeyId::new(3)]);
        assert_eq!(ring.key_ids(), vec![KeyId::new(4), KeyId::new(5)]);

        let sealed_old = {
            let mut other = KeyRing::generate();
            other.seal(b"x").unwrap()
        };
        assert!(ring.open(&sealed_old).is_err());
    }

    #[test]
    fn erase_respects_horizon() {
        let mut ring = KeyRing::generate();
        for _ in 0..4 {
            ring.rotate();
        }

        let erased = ring.erase_below(KeyId::new(2));
        assert_eq!(erased, vec![KeyId::new(1)]);
    }
}
