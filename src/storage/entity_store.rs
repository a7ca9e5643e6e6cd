use crate::action::{EntityId, EntityRecord};
use crate::commitlog::write_atomically;
use crate::crypto::{sealed_key_id, KeyId, KeyReferences, KeyRingHandle, Reseal};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const ENTITY_EXTENSION: &str = "entity";
const LOCK_STRIPES: usize = 64;

/// EntityStore persists one sealed file per entity, named by entity id. Files only hold the
/// entity's metadata and action log; derived state is recomputed by the reducer.
///
/// Writers to the same entity are serialized through a striped lock table, so `reseal()` can run
/// next to the apply loop without losing a write.
pub struct EntityStore {
    directory: PathBuf,
    key_ring: KeyRingHandle,
    stripes: Vec<Mutex<()>>,
}

impl EntityStore {
    pub fn open(directory: PathBuf, key_ring: KeyRingHandle) -> Result<Self, io::Error> {
        fs::create_dir_all(&directory)?;
        Ok(EntityStore {
            directory,
            key_ring,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn load(&self, id: &EntityId) -> Result<Option<EntityRecord>, io::Error> {
        match self.load_plaintext(id)? {
            None => Ok(None),
            Some(bytes) => EntityRecord::from_json_bytes(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e)),
        }
    }

    /// Decrypted JSON form, as shipped inside snapshots.
    pub fn load_plaintext(&self, id: &EntityId) -> Result<Option<Vec<u8>>, io::Error> {
        let _guard = self.lock(id);
        match fs::read(self.path(id)) {
            Ok(sealed) => Ok(Some(self.key_ring.open(&sealed)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, record: &EntityRecord) -> Result<(), io::Error> {
        let bytes = record
            .to_json_bytes()
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        self.save_plaintext(&record.id, &bytes)
    }

    /// Seals `plaintext` under the local active key. Used by snapshot restore, which writes
    /// entities straight to disk without materializing them.
    pub fn save_plaintext(&self, id: &EntityId, plaintext: &[u8]) -> Result<(), io::Error> {
        let sealed = self.key_ring.seal(plaintext)?;
        let _guard = self.lock(id);
        write_atomically(&self.path(id), &sealed)
    }

    pub fn delete(&self, id: &EntityId) -> Result<(), io::Error> {
        let _guard = self.lock(id);
        match fs::remove_file(self.path(id)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Entity ids present on disk, from file names alone. Nothing is decrypted.
    pub fn list_ids(&self) -> Result<Vec<EntityId>, io::Error> {
        let mut ids = Vec::new();
        for dir_entry in fs::read_dir(&self.directory)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTITY_EXTENSION) {
                continue;
            }
            let parsed = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| EntityId::parse(s).ok());
            if let Some(id) = parsed {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path(&self, id: &EntityId) -> PathBuf {
        self.directory.join(format!("{}.{}", id, ENTITY_EXTENSION))
    }

    fn lock(&self, id: &EntityId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[stripe].lock().expect("EntityStore stripe lock poisoned")
    }
}

impl Reseal for EntityStore {
    /// Re-seals every entity still under a retired key. Returns how many were rewritten.
    fn reseal(&self) -> Result<usize, io::Error> {
        let active = self.key_ring.active_key_id();
        let mut count = 0;
        for id in self.list_ids()? {
            let _guard = self.lock(&id);
            let path = self.path(&id);
            let sealed = match fs::read(&path) {
                Ok(sealed) => sealed,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if sealed_key_id(&sealed) == Some(active) {
                continue;
            }
            let plaintext = self.key_ring.open(&sealed)?;
            write_atomically(&path, &self.key_ring.seal(&plaintext)?)?;
            count += 1;
        }
        Ok(count)
    }
}

impl KeyReferences for EntityStore {
    fn oldest_referenced_key(&self) -> Result<Option<KeyId>, io::Error> {
        crate::storage::KeyScan::all_files(self.directory.clone(), ENTITY_EXTENSION).oldest_referenced_key()
    }
}
