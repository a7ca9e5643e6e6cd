use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const ENTRY_EXTENSION: &str = "log";
const META_FILE_NAME: &str = "log.meta";

/// SegmentedDiskLog is a durable log with one file per entry, named by zero-padded index so a
/// directory listing sorts in log order. Every file is written to a temporary name, synced, then
/// renamed into place, so a crash leaves either the whole entry or none of it.
///
/// `log.meta` holds the first index after compaction or snapshot install.
pub struct SegmentedDiskLog<E: Entry> {
    directory: PathBuf,
    first_index: Index,
    next_index: Index,
    _pd: PhantomData<E>,
}

// Generic config for initializing any type of disk-based commit log, independent of data
// model and algorithm.
pub struct StorageConfig {
    pub directory: PathBuf,
}

impl<E: Entry> SegmentedDiskLog<E> {
    /// Opens the log in `config.directory`, creating it if needed, and recovers its bounds.
    pub fn open(config: StorageConfig) -> Result<Self, io::Error> {
        fs::create_dir_all(&config.directory)?;

        let meta_first_index = read_meta(&config.directory)?;
        let indexes = list_entry_indexes(&config.directory)?;

        let first_index = meta_first_index.unwrap_or_else(Index::start_index);
        let mut next_index = first_index;
        for index in indexes.iter().copied() {
            if index < first_index {
                // Left over from a compaction that crashed before deleting it.
                remove_if_exists(&entry_path(&config.directory, index))?;
                continue;
            }
            if index != next_index {
                // A gap means the tail after it was being truncated. Finish the job.
                remove_if_exists(&entry_path(&config.directory, index))?;
                continue;
            }
            next_index = next_index.plus(1);
        }

        Ok(SegmentedDiskLog {
            directory: config.directory,
            first_index,
            next_index,
            _pd: PhantomData::default(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn write_meta(&self, first_index: Index) -> Result<(), io::Error> {
        write_atomically(
            &self.directory.join(META_FILE_NAME),
            first_index.as_u64().to_string().as_bytes(),
        )
    }
}

impl<E: Entry> Log<E> for SegmentedDiskLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index;
        let bytes: Vec<u8> = entry.into();
        write_atomically(&entry_path(&self.directory, index), &bytes)?;
        self.next_index = index.plus(1);

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        if index < self.first_index || index >= self.next_index {
            return Ok(None);
        }

        match fs::read(entry_path(&self.directory, index)) {
            Ok(bytes) => E::try_from(bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let from = std::cmp::max(index, self.first_index);
        // Delete from the tail backwards so a crash midway leaves a contiguous prefix.
        let mut current = self.next_index;
        while current > from {
            current = current.minus(1);
            remove_if_exists(&entry_path(&self.directory, current))?;
            self.next_index = current;
        }

        Ok(())
    }

    fn next_index(&self) -> Index {
        self.next_index
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        if through < self.first_index {
            return Ok(());
        }

        let new_first = through.plus(1);
        // Meta first, so a crash leaves files below `first_index` that `open()` cleans up.
        self.write_meta(new_first)?;

        let mut current = self.first_index;
        while current <= through && current < self.next_index {
            remove_if_exists(&entry_path(&self.directory, current))?;
            current = current.plus(1);
        }

        self.first_index = new_first;
        if self.next_index < new_first {
            self.next_index = new_first;
        }
        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.write_meta(next_index)?;

        for index in list_entry_indexes(&self.directory)? {
            remove_if_exists(&entry_path(&self.directory, index))?;
        }

        self.first_index = next_index;
        self.next_index = next_index;
        Ok(())
    }
}

pub(crate) fn entry_path(directory: &Path, index: Index) -> PathBuf {
    directory.join(format!("{:020}.{}", index.as_u64(), ENTRY_EXTENSION))
}

/// Indexes of every entry file in `directory`, ascending.
pub(crate) fn list_entry_indexes(directory: &Path) -> Result<Vec<Index>, io::Error> {
    let mut indexes = Vec::new();
    for dir_entry in fs::read_dir(directory)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
            continue;
        }
        let parsed = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
            .and_then(Index::from_u64_opt);
        if let Some(index) = parsed {
            indexes.push(index);
        }
    }

    indexes.sort();
    Ok(indexes)
}

fn read_meta(directory: &Path) -> Result<Option<Index>, io::Error> {
    match fs::read_to_string(directory.join(META_FILE_NAME)) {
        Ok(contents) => {
            let value = contents
                .trim()
                .parse::<u64>()
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
            Ok(Index::from_u64_opt(value))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), io::Error> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Writes `bytes` to a sibling temp file, syncs it, and renames it over `path`.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        // Best effort: not every platform lets you open a directory to sync it.
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}
