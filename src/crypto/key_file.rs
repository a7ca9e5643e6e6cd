use crate::commitlog::write_atomically;
use crate::crypto::keyring::{DataKey, KeyId, KeyRing};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::convert::TryInto;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const SECRET_FILE_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_RING_MAGIC: &[u8; 4] = b"SBKR";
const KEY_RING_INFO: &[u8] = b"scorebook-keyring-v1";

#[derive(Debug, thiserror::Error)]
pub enum SecretFileError {
    /// A sealed file exists but the operator secret that unlocks it wasn't supplied. Halts
    /// startup.
    #[error("Sealed file {0:?} exists but no unlocking secret was provided")]
    MissingSecret(PathBuf),
    #[error("Sealed file {0:?} can't be opened with the provided secret")]
    WrongSecret(PathBuf),
    #[error("Sealed file {0:?} is corrupt: {1}")]
    Corrupt(PathBuf, String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl From<SecretFileError> for io::Error {
    fn from(e: SecretFileError) -> Self {
        match e {
            SecretFileError::Io(e) => e,
            other => io::Error::new(ErrorKind::InvalidData, other),
        }
    }
}

/// SecretFile seals a small file with a key derived from an operator secret. The salt is
/// generated fresh on every write and stored in the clear, so the secret alone is enough to
/// open it.
///
/// ```text
/// [magic 4][version 1][salt 16][nonce 12][ciphertext + tag]
/// ```
pub(crate) struct SecretFile {
    path: PathBuf,
    magic: &'static [u8; 4],
    info: &'static [u8],
    secret: Zeroizing<Vec<u8>>,
}

impl SecretFile {
    pub(crate) fn new(
        path: PathBuf,
        magic: &'static [u8; 4],
        info: &'static [u8],
        secret: &[u8],
    ) -> Self {
        SecretFile {
            path,
            magic,
            info,
            secret: Zeroizing::new(secret.to_vec()),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` if the file doesn't exist yet.
    pub(crate) fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, SecretFileError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.secret.is_empty() {
            return Err(SecretFileError::MissingSecret(self.path.clone()));
        }

        let header_len = self.magic.len() + 1;
        if bytes.len() < header_len + SALT_LEN + NONCE_LEN
            || &bytes[..self.magic.len()] != self.magic
            || bytes[self.magic.len()] != SECRET_FILE_VERSION
        {
            return Err(SecretFileError::Corrupt(
                self.path.clone(),
                "bad header".to_string(),
            ));
        }

        let salt = &bytes[header_len..header_len + SALT_LEN];
        let nonce = &bytes[header_len + SALT_LEN..header_len + SALT_LEN + NONCE_LEN];
        let ciphertext = &bytes[header_len + SALT_LEN + NONCE_LEN..];

        let plaintext = self
            .cipher(salt)
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &bytes[..header_len],
                },
            )
            .map_err(|_| SecretFileError::WrongSecret(self.path.clone()))?;

        Ok(Some(Zeroizing::new(plaintext)))
    }

    pub(crate) fn store(&self, plaintext: &[u8]) -> Result<(), SecretFileError> {
        if self.secret.is_empty() {
            return Err(SecretFileError::MissingSecret(self.path.clone()));
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut out = Vec::with_capacity(self.magic.len() + 1 + SALT_LEN + NONCE_LEN + plaintext.len() + 16);
        out.extend_from_slice(self.magic);
        out.push(SECRET_FILE_VERSION);
        let header_len = out.len();

        let ciphertext = self
            .cipher(&salt)
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &out[..header_len],
                },
            )
            .map_err(|_| io::Error::new(ErrorKind::Other, "Encryption failed"))?;

        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomically(&self.path, &out)?;
        Ok(())
    }

    fn cipher(&self, salt: &[u8]) -> ChaCha20Poly1305 {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &self.secret);
        let mut wrapping_key = Zeroizing::new([0u8; 32]);
        // 32 bytes is always a valid HKDF-SHA256 output length.
        let _ = hkdf.expand(self.info, wrapping_key.as_mut());
        ChaCha20Poly1305::new(Key::from_slice(wrapping_key.as_ref()))
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredKeyRing {
    active: KeyId,
    keys: Vec<StoredKey>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredKey {
    id: KeyId,
    material: String,
    created_at: DateTime<Utc>,
}

/// KeyFile persists the node's key ring, sealed under the operator secret.
pub struct KeyFile {
    file: SecretFile,
}

impl KeyFile {
    pub fn new(path: PathBuf, secret: &[u8]) -> Self {
        KeyFile {
            file: SecretFile::new(path, KEY_RING_MAGIC, KEY_RING_INFO, secret),
        }
    }

    /// Loads the ring, or generates and stores a fresh one on first start.
    pub fn load_or_create(&self) -> Result<KeyRing, SecretFileError> {
        match self.load()? {
            Some(ring) => Ok(ring),
            None => {
                let ring = KeyRing::generate();
                self.store(&ring)?;
                Ok(ring)
            }
        }
    }

    pub fn load(&self) -> Result<Option<KeyRing>, SecretFileError> {
        let plaintext = match self.file.load()? {
            None => return Ok(None),
            Some(plaintext) => plaintext,
        };
        let path = self.file.path().to_path_buf();

        let stored: StoredKeyRing = serde_json::from_slice(&plaintext)
            .map_err(|e| SecretFileError::Corrupt(path.clone(), e.to_string()))?;

        let mut keys = Vec::with_capacity(stored.keys.len());
        for key in stored.keys {
            let raw = Zeroizing::new(
                hex::decode(&key.material)
                    .map_err(|e| SecretFileError::Corrupt(path.clone(), e.to_string()))?,
            );
            let material: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                SecretFileError::Corrupt(path.clone(), format!("key {:?} has bad length", key.id))
            })?;
            keys.push(DataKey {
                id: key.id,
                material: Zeroizing::new(material),
                created_at: key.created_at,
            });
        }

        KeyRing::from_parts(stored.active, keys)
            .map(Some)
            .map_err(|e| SecretFileError::Corrupt(path, e.to_string()))
    }

    pub fn store(&self, ring: &KeyRing) -> Result<(), SecretFileError> {
        let stored = StoredKeyRing {
            active: ring.active_key_id(),
            keys: ring
                .keys()
                .map(|k| StoredKey {
                    id: k.id,
                    material: hex::encode(k.material.as_ref()),
                    created_at: k.created_at,
                })
                .collect(),
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&stored).map_err(|e| io::Error::new(ErrorKind::Other, e))?,
        );
        self.file.store(&plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ring_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.sealed");

        let file = KeyFile::new(path.clone(), b"operator secret");
        let mut ring = file.load_or_create().unwrap();
        let old = ring.seal(b"first").unwrap();
        ring.rotate();
        file.store(&ring).unwrap();

        let reloaded = KeyFile::new(path, b"operator secret").load().unwrap().unwrap();
        assert_eq!(reloaded.active_key_id(), KeyId::new(2));
        assert_eq!(reloaded.open(&old).unwrap(), b"first");
    }

    #[test]
    fn missing_secret_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.sealed");
        KeyFile::new(path.clone(), b"operator secret")
            .load_or_create()
            .unwrap();

        let result = KeyFile::new(path, b"").load();
        assert!(matches!(result, Err(SecretFileError::MissingSecret(_))));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.sealed");
        KeyFile::new(path.clone(), b"right").load_or_create().unwrap();

        let result = KeyFile::new(path, b"wrong").load();
        assert!(matches!(result, Err(SecretFileError::WrongSecret(_))));
    }
}
