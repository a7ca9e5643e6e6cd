use crate::commitlog::write_atomically;
use crate::crypto::{sealed_key_id, KeyId, KeyReferences, KeyRingHandle, Reseal};
use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::Mutex;

const VALUE_EXTENSION: &str = "val";

/// StableStore is a small durable key-value store for values that must survive restarts: term
/// and vote, the trust store. Each put is atomic.
pub trait StableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), io::Error>;
    fn keys(&self) -> Result<Vec<String>, io::Error>;
}

/// One file per key, replaced atomically on every put.
pub struct FileStableStore {
    directory: PathBuf,
}

impl FileStableStore {
    pub fn open(directory: PathBuf) -> Result<Self, io::Error> {
        fs::create_dir_all(&directory)?;
        Ok(FileStableStore { directory })
    }

    fn path(&self, key: &str) -> Result<PathBuf, io::Error> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("Invalid stable store key {:?}", key),
            ));
        }
        Ok(self.directory.join(format!("{}.{}", key, VALUE_EXTENSION)))
    }
}

impl StableStore for FileStableStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
        match fs::read(self.path(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), io::Error> {
        write_atomically(&self.path(key)?, value)
    }

    fn keys(&self) -> Result<Vec<String>, io::Error> {
        let mut keys = Vec::new();
        for dir_entry in fs::read_dir(&self.directory)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[derive(Default)]
pub struct MemoryStableStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StableStore for MemoryStableStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
        Ok(self
            .values
            .lock()
            .expect("MemoryStableStore lock poisoned")
            .get(key)
            .cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), io::Error> {
        self.values
            .lock()
            .expect("MemoryStableStore lock poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, io::Error> {
        let mut keys: Vec<String> = self
            .values
            .lock()
            .expect("MemoryStableStore lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Seals every value with the key ring's active key before it reaches the inner store. The
/// inner store never sees plaintext.
pub struct EncryptedStableStore<S: StableStore> {
    inner: S,
    key_ring: KeyRingHandle,
}

impl<S: StableStore> EncryptedStableStore<S> {
    pub fn new(inner: S, key_ring: KeyRingHandle) -> Self {
        EncryptedStableStore { inner, key_ring }
    }
}

impl<S: StableStore> StableStore for EncryptedStableStore<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
        match self.inner.get(key)? {
            None => Ok(None),
            Some(sealed) => Ok(Some(self.key_ring.open(&sealed)?)),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), io::Error> {
        self.inner.put(key, &self.key_ring.seal(value)?)
    }

    fn keys(&self) -> Result<Vec<String>, io::Error> {
        self.inner.keys()
    }
}

impl<S: StableStore> Reseal for EncryptedStableStore<S> {
    /// Re-seals every value still under a retired key. Returns how many were rewritten.
    fn reseal(&self) -> Result<usize, io::Error> {
        let active = self.key_ring.active_key_id();
        let mut count = 0;
        for key in self.inner.keys()? {
            let sealed = match self.inner.get(&key)? {
                Some(sealed) => sealed,
                None => continue,
            };
            if sealed_key_id(&sealed) == Some(active) {
                continue;
            }
            let plaintext = self.key_ring.open(&sealed)?;
            self.inner.put(&key, &self.key_ring.seal(&plaintext)?)?;
            count += 1;
        }
        Ok(count)
    }
}

impl<S: StableStore> KeyReferences for EncryptedStableStore<S> {
    fn oldest_referenced_key(&self) -> Result<Option<KeyId>, io::Error> {
        let mut oldest = None;
        for key in self.inner.keys()? {
            if let Some(id) = self.inner.get(&key)?.as_deref().and_then(sealed_key_id) {
                oldest = Some(oldest.map_or(id, |o: KeyId| std::cmp::min(o, id)));
            }
        }
        Ok(oldest)
    }
}

// Lets callers share one store between the replica and the trust store.
impl<T: StableStore + ?Sized> StableStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), io::Error> {
        (**self).put(key, value)
    }

    fn keys(&self) -> Result<Vec<String>, io::Error> {
        (**self).keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trip_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStableStore::open(dir.path().to_path_buf()).unwrap();

        assert_eq!(store.get("term").unwrap(), None);
        store.put("term", b"7").unwrap();
        store.put("vote", b"node-a").unwrap();
        store.put("term", b"8").unwrap();

        let reopened = FileStableStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.get("term").unwrap(), Some(b"8".to_vec()));
        assert_eq!(reopened.keys().unwrap(), vec!["term".to_string(), "vote".to_string()]);
        assert!(reopened.put("../escape", b"x").is_err());
    }

    #[test]
    fn encrypted_store_hides_plaintext() {
        let ring = KeyRingHandle::ephemeral();
        let store = EncryptedStableStore::new(MemoryStableStore::new(), ring.clone());

        store.put("vote", b"node-a").unwrap();
        assert_eq!(store.get("vote").unwrap(), Some(b"node-a".to_vec()));

        let raw = store.inner.get("vote").unwrap().unwrap();
        assert!(!raw.windows(6).any(|w| w == b"node-a"));
    }

    #[test]
    fn reseal_moves_values_to_active_key() {
        let ring = KeyRingHandle::ephemeral();
        let store = EncryptedStableStore::new(MemoryStableStore::new(), ring.clone());
        store.put("term", b"3").unwrap();
        assert_eq!(store.oldest_referenced_key().unwrap(), Some(KeyId::new(1)));

        ring.rotate().unwrap();
        assert_eq!(store.reseal().unwrap(), 1);
        assert_eq!(store.oldest_referenced_key().unwrap(), Some(KeyId::new(2)));
        assert_eq!(store.get("term").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.reseal().unwrap(), 0);
    }

    #[test]
    fn tampered_value_is_invalid_data() {
        let ring = KeyRingHandle::ephemeral();
        let store = EncryptedStableStore::new(MemoryStableStore::new(), ring);
        store.put("term", b"3").unwrap();

        let mut raw = store.inner.get("term").unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        store.inner.put("term", &raw).unwrap();

        let err = store.get("term").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
