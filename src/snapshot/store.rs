use crate::action::EntityId;
use crate::commitlog::Index;
use crate::crypto::{sealed_key_id, KeyId, KeyReferences, KeyRingHandle};
use crate::grpc::proto_snapshot_chunk::Record as ProtoRecord;
use crate::grpc::{ProtoSnapshotChunk, ProtoSnapshotEntity, ProtoSnapshotManifest};
use crate::membership::Membership;
use crate::replica::{SnapshotPoint, SnapshotSource, StagedSnapshot, Term};
use crate::snapshot::format::{self, Record, SnapshotManifest};
use crate::storage::EntityStore;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

const SNAPSHOT_EXTENSION: &str = "snap";
const STAGING_EXTENSION: &str = "partial";
// Enough of a sealed record to read the key id out of its header.
const SEALED_HEADER_PROBE: usize = 5;

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// SnapshotStore keeps the newest `retained` snapshots of the entity state, one file each, named
/// by the log position they cover. Files are built under a staging name and renamed into place,
/// so a listed snapshot is always complete.
pub(crate) struct SnapshotStore {
    logger: slog::Logger,
    directory: PathBuf,
    key_ring: KeyRingHandle,
    retained: usize,
}

impl SnapshotStore {
    pub(crate) fn open(
        logger: slog::Logger,
        directory: PathBuf,
        key_ring: KeyRingHandle,
        retained: usize,
    ) -> Result<Self, io::Error> {
        fs::create_dir_all(&directory)?;
        for path in list_with_extension(&directory, STAGING_EXTENSION)? {
            slog::info!(logger, "Removing incomplete snapshot {:?}", path);
            fs::remove_file(&path)?;
        }

        Ok(SnapshotStore {
            logger,
            directory,
            key_ring,
            retained: std::cmp::max(retained, 1),
        })
    }

    /// Writes a snapshot of every stored entity as of `point`. The caller makes sure nothing is
    /// applied while this runs.
    pub(crate) fn create(
        &self,
        point: SnapshotPoint,
        entities: &EntityStore,
        membership: &Membership,
    ) -> Result<(), io::Error> {
        let ids = entities.list_ids()?;
        let manifest = SnapshotManifest {
            last_included_term: point.term.as_u64(),
            last_included_index: point.index.as_u64(),
            members: membership.members().cloned().collect(),
            entity_count: ids.len() as u64,
        };

        let mut writer = self.stage(&manifest)?;
        for id in ids {
            let plaintext = entities
                .load_plaintext(&id)?
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("Entity {} vanished", id)))?;
            writer.add_entity(&id, &plaintext)?;
        }
        writer.finish()?.commit_impl()?;

        slog::info!(self.logger, "Created snapshot at {:?}", point);
        Ok(())
    }

    /// The newest complete snapshot, if any.
    pub(crate) fn latest(&self) -> Result<Option<SnapshotPoint>, io::Error> {
        Ok(self.list()?.into_iter().last().map(|(point, _)| point))
    }

    pub(crate) fn reader(&self, point: SnapshotPoint) -> Result<SnapshotReader, io::Error> {
        SnapshotReader::open(&snapshot_path(&self.directory, point), self.key_ring.clone())
    }

    /// Starts receiving a snapshot from the leader. Entities added to the writer are sealed under
    /// this node's own key.
    pub(crate) fn stage(&self, manifest: &SnapshotManifest) -> Result<SnapshotWriter, io::Error> {
        let point = SnapshotPoint {
            term: Term::new(manifest.last_included_term),
            index: Index::from_u64_opt(manifest.last_included_index)
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "Snapshot must cover at least one entry"))?,
        };
        let staging_path = self.directory.join(format!(
            "{:020}-{}.{}",
            point.index.as_u64(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed),
            STAGING_EXTENSION
        ));

        let mut file = BufWriter::new(File::create(&staging_path)?);
        format::write_header(&mut file)?;
        let sealed = self.key_ring.seal(
            &manifest
                .to_json_bytes()
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?,
        )?;
        format::write_manifest(&mut file, &sealed)?;

        Ok(SnapshotWriter {
            file: Some(file),
            staging_path,
            final_path: snapshot_path(&self.directory, point),
            directory: self.directory.clone(),
            retained: self.retained,
            key_ring: self.key_ring.clone(),
            expected_entities: manifest.entity_count,
            written_entities: 0,
        })
    }

    fn list(&self) -> Result<Vec<(SnapshotPoint, PathBuf)>, io::Error> {
        list_snapshots(&self.directory)
    }
}

impl SnapshotSource for SnapshotStore {
    fn latest_point(&self) -> Option<SnapshotPoint> {
        match self.latest() {
            Ok(point) => point,
            Err(e) => {
                slog::warn!(self.logger, "Failed to list snapshots: {:?}", e);
                None
            }
        }
    }

    fn stream_chunks(
        &self,
        point: SnapshotPoint,
        client_node_id: String,
        term: Term,
        sink: mpsc::Sender<ProtoSnapshotChunk>,
    ) -> Result<(), io::Error> {
        let mut reader = self.reader(point)?;
        let manifest = reader.manifest().clone();
        let membership = serde_json::to_vec(&manifest.members).map_err(|e| io::Error::new(ErrorKind::Other, e))?;

        let first = ProtoSnapshotChunk {
            record: Some(ProtoRecord::Manifest(ProtoSnapshotManifest {
                client_node_id,
                term: term.as_u64(),
                last_included_index: manifest.last_included_index,
                last_included_term: manifest.last_included_term,
                membership,
                entity_count: manifest.entity_count,
            })),
        };
        if sink.blocking_send(first).is_err() {
            return Ok(());
        }

        while let Some((id, sealed)) = reader.next_sealed_entity()? {
            // Crosses the wire decrypted. The receiver seals it under its own key.
            let record = self.key_ring.open(&sealed)?;
            let chunk = ProtoSnapshotChunk {
                record: Some(ProtoRecord::Entity(ProtoSnapshotEntity {
                    entity_id: id.to_string(),
                    record,
                })),
            };
            if sink.blocking_send(chunk).is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl KeyReferences for SnapshotStore {
    fn oldest_referenced_key(&self) -> Result<Option<KeyId>, io::Error> {
        let mut oldest: Option<KeyId> = None;
        for (_, path) in self.list()? {
            let mut reader = match File::open(&path) {
                Ok(file) => BufReader::new(file),
                // Pruned between listing and reading.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            format::read_header(&mut reader)?;
            while let Some(head) = format::skim_record(&mut reader, SEALED_HEADER_PROBE)? {
                if let Some(id) = sealed_key_id(&head) {
                    oldest = Some(oldest.map_or(id, |o| std::cmp::min(o, id)));
                }
            }
        }
        Ok(oldest)
    }
}

/// Builds one snapshot file. Dropped without `finish()`, the partial file is removed.
pub(crate) struct SnapshotWriter {
    file: Option<BufWriter<File>>,
    staging_path: PathBuf,
    final_path: PathBuf,
    directory: PathBuf,
    retained: usize,
    key_ring: KeyRingHandle,
    expected_entities: u64,
    written_entities: u64,
}

impl SnapshotWriter {
    pub(crate) fn add_entity(&mut self, id: &EntityId, plaintext: &[u8]) -> Result<(), io::Error> {
        if self.written_entities >= self.expected_entities {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("More entities than the {} the manifest announced", self.expected_entities),
            ));
        }
        let sealed = self.key_ring.seal(plaintext)?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "Snapshot writer already finished"))?;
        format::write_entity(file, id, &sealed)?;
        self.written_entities += 1;
        Ok(())
    }

    /// Flushes and syncs. The snapshot is not visible until the result is committed.
    pub(crate) fn finish(mut self) -> Result<StagedSnapshotFile, io::Error> {
        if self.written_entities != self.expected_entities {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Manifest announced {} entities, received {}",
                    self.expected_entities, self.written_entities
                ),
            ));
        }

        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "Snapshot writer already finished"))?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(StagedSnapshotFile {
            staging_path: Some(std::mem::take(&mut self.staging_path)),
            final_path: std::mem::take(&mut self.final_path),
            directory: std::mem::take(&mut self.directory),
            retained: self.retained,
        })
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = fs::remove_file(&self.staging_path);
        }
    }
}

/// A fully written snapshot that isn't the latest yet.
pub(crate) struct StagedSnapshotFile {
    staging_path: Option<PathBuf>,
    final_path: PathBuf,
    directory: PathBuf,
    retained: usize,
}

impl StagedSnapshotFile {
    fn commit_impl(mut self) -> Result<(), io::Error> {
        if let Some(staging_path) = self.staging_path.take() {
            fs::rename(&staging_path, &self.final_path)?;
            if let Ok(dir) = File::open(&self.directory) {
                let _ = dir.sync_all();
            }
        }
        prune(&self.directory, self.retained)
    }
}

impl StagedSnapshot for StagedSnapshotFile {
    fn commit(self: Box<Self>) -> Result<(), io::Error> {
        (*self).commit_impl()
    }
}

impl Drop for StagedSnapshotFile {
    fn drop(&mut self) {
        if let Some(staging_path) = &self.staging_path {
            let _ = fs::remove_file(staging_path);
        }
    }
}

/// Reads one snapshot file: the manifest up front, then sealed entity records on demand.
pub(crate) struct SnapshotReader {
    reader: BufReader<File>,
    manifest: SnapshotManifest,
}

impl SnapshotReader {
    fn open(path: &Path, key_ring: KeyRingHandle) -> Result<Self, io::Error> {
        let mut reader = BufReader::new(File::open(path)?);
        format::read_header(&mut reader)?;

        let manifest = match format::read_record(&mut reader)? {
            Some(Record::Manifest(sealed)) => {
                let plaintext = key_ring.open(&sealed)?;
                SnapshotManifest::from_json_bytes(&plaintext).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?
            }
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "Snapshot doesn't start with a manifest",
                ))
            }
        };

        Ok(SnapshotReader { reader, manifest })
    }

    pub(crate) fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    pub(crate) fn membership(&self) -> Membership {
        Membership::from_members(self.manifest.members.iter().cloned())
    }

    /// Next entity, still sealed.
    pub(crate) fn next_sealed_entity(&mut self) -> Result<Option<(EntityId, Vec<u8>)>, io::Error> {
        match format::read_record(&mut self.reader)? {
            None => Ok(None),
            Some(Record::Entity(id, sealed)) => Ok(Some((id, sealed))),
            Some(Record::Manifest(_)) => Err(io::Error::new(ErrorKind::InvalidData, "Second manifest in snapshot")),
        }
    }
}

fn snapshot_path(directory: &Path, point: SnapshotPoint) -> PathBuf {
    directory.join(format!(
        "{:020}-{:020}.{}",
        point.index.as_u64(),
        point.term.as_u64(),
        SNAPSHOT_EXTENSION
    ))
}

fn parse_snapshot_name(path: &Path) -> Option<SnapshotPoint> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.splitn(2, '-');
    let index = Index::from_u64_opt(parts.next()?.parse().ok()?)?;
    let term = Term::new(parts.next()?.parse().ok()?);
    Some(SnapshotPoint { term, index })
}

/// Complete snapshots, oldest first.
fn list_snapshots(directory: &Path) -> Result<Vec<(SnapshotPoint, PathBuf)>, io::Error> {
    let mut snapshots: Vec<_> = list_with_extension(directory, SNAPSHOT_EXTENSION)?
        .into_iter()
        .filter_map(|path| parse_snapshot_name(&path).map(|point| (point, path)))
        .collect();
    snapshots.sort_by_key(|(point, _)| point.index);
    Ok(snapshots)
}

fn prune(directory: &Path, retained: usize) -> Result<(), io::Error> {
    let snapshots = list_snapshots(directory)?;
    if snapshots.len() <= retained {
        return Ok(());
    }
    for (_, path) in snapshots[..snapshots.len() - retained].iter() {
        match fs::remove_file(path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn list_with_extension(directory: &Path, extension: &str) -> Result<Vec<PathBuf>, io::Error> {
    let mut paths = Vec::new();
    for dir_entry in fs::read_dir(directory)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
