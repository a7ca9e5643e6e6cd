use crate::commitlog::write_atomically;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::Mutex;

/// What the state machine has durably applied. `initialized` is set once the node has either
/// applied from an empty log or completed a full snapshot restore, and is what allows a later
/// snapshot at or below `index` to skip its data.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedMarker {
    pub index: u64,
    pub term: u64,
    pub initialized: bool,
}

/// One marker per node, written after each applied entry.
pub struct AppliedIndexStore {
    path: Option<PathBuf>,
    current: Mutex<AppliedMarker>,
}

impl AppliedIndexStore {
    pub fn open(path: PathBuf) -> Result<Self, io::Error> {
        let current = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => AppliedMarker::default(),
            Err(e) => return Err(e),
        };

        Ok(AppliedIndexStore {
            path: Some(path),
            current: Mutex::new(current),
        })
    }

    pub fn in_memory() -> Self {
        AppliedIndexStore {
            path: None,
            current: Mutex::new(AppliedMarker::default()),
        }
    }

    pub fn get(&self) -> AppliedMarker {
        *self.current.lock().expect("AppliedIndexStore lock poisoned")
    }

    pub fn set(&self, marker: AppliedMarker) -> Result<(), io::Error> {
        let mut current = self.current.lock().expect("AppliedIndexStore lock poisoned");
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec(&marker).map_err(|e| io::Error::new(ErrorKind::Other, e))?;
            write_atomically(path, &bytes)?;
        }
        *current = marker;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applied.json");

        let store = AppliedIndexStore::open(path.clone()).unwrap();
        assert_eq!(store.get(), AppliedMarker::default());
        store
            .set(AppliedMarker {
                index: 500,
                term: 3,
                initialized: true,
            })
            .unwrap();

        let reopened = AppliedIndexStore::open(path).unwrap();
        assert_eq!(reopened.get().index, 500);
        assert!(reopened.get().initialized);
    }
}
