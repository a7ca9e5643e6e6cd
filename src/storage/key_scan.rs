use crate::crypto::{sealed_key_id, KeyId, KeyReferences};
use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};

// Only the sealed header is needed.
const HEADER_PROBE_LEN: usize = 5;

enum ScanMode {
    /// Every matching file may hold a different key.
    AllFiles,
    /// Files are written in name order under a monotonically advancing key, so the first name
    /// holds the oldest key. Used for log directories.
    LowestNamed,
}

/// KeyScan reports the oldest key referenced by sealed files in a directory by reading their
/// headers. Nothing is decrypted.
pub struct KeyScan {
    directory: PathBuf,
    extension: &'static str,
    mode: ScanMode,
}

impl KeyScan {
    pub fn all_files(directory: PathBuf, extension: &'static str) -> Self {
        KeyScan {
            directory,
            extension,
            mode: ScanMode::AllFiles,
        }
    }

    pub fn lowest_named(directory: PathBuf, extension: &'static str) -> Self {
        KeyScan {
            directory,
            extension,
            mode: ScanMode::LowestNamed,
        }
    }

    fn matching_files(&self) -> Result<Vec<PathBuf>, io::Error> {
        let read_dir = match fs::read_dir(&self.directory) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut paths = Vec::new();
        for dir_entry in read_dir {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(self.extension) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl KeyReferences for KeyScan {
    fn oldest_referenced_key(&self) -> Result<Option<KeyId>, io::Error> {
        let files = self.matching_files()?;
        let candidates: &[PathBuf] = match self.mode {
            ScanMode::AllFiles => &files,
            ScanMode::LowestNamed => &files[..std::cmp::min(1, files.len())],
        };

        let mut oldest: Option<KeyId> = None;
        for path in candidates {
            if let Some(id) = read_header_key(path)? {
                oldest = Some(oldest.map_or(id, |o| std::cmp::min(o, id)));
            }
        }
        Ok(oldest)
    }
}

fn read_header_key(path: &Path) -> Result<Option<KeyId>, io::Error> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        // Deleted between listing and reading.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut header = Vec::with_capacity(HEADER_PROBE_LEN);
    file.by_ref().take(HEADER_PROBE_LEN as u64).read_to_end(&mut header)?;
    Ok(sealed_key_id(&header))
}
