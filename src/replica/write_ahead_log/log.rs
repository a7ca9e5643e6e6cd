use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::write_ahead_log::commit_stream::{CommitStreamPublisher, SnapshotPoint};
use crate::replica::WriteAheadLogEntry;
use bytes::Bytes;
use std::cmp;
use std::io::{self, ErrorKind};

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been published on the commit stream
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// Once a snapshot covers a prefix of the log, that prefix may be compacted away. The snapshot
/// point then stands in for the last compacted entry.
pub(in super::super) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,
    // Last entry covered by the newest snapshot we know of.
    snapshot_point: Option<SnapshotPoint>,

    // Commit stream to publish committed entries to. To be consumed by the FSM.
    commit_stream: CommitStreamPublisher,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry published on the commit stream. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// Recovers from whatever `log` already holds.
    ///
    /// `applied_index` is the FSM's durable marker. Everything at or below it (or the snapshot
    /// point) was committed before the restart, so it is neither re-committed nor re-published.
    pub(super) fn new(
        logger: slog::Logger,
        mut log: L,
        commit_stream: CommitStreamPublisher,
        snapshot_point: Option<SnapshotPoint>,
        applied_index: Option<Index>,
    ) -> Result<Self, io::Error> {
        let mut latest_entry_metadata = None;
        if log.next_index() > log.first_index() {
            let latest_index = log.next_index().minus(1);
            latest_entry_metadata = log.read(latest_index)?.map(|entry| (entry.term, latest_index));
        }

        if let Some(point) = snapshot_point {
            let log_is_behind = match latest_entry_metadata {
                None => true,
                Some((_, latest_index)) => latest_index < point.index,
            };
            if log_is_behind {
                // A snapshot install was interrupted between persisting the snapshot and
                // resetting the log.
                slog::info!(logger, "Log is behind snapshot {:?}, resetting it", point);
                log.reset(point.index.plus(1))?;
                latest_entry_metadata = Some((point.term, point.index));
            }
        }

        let recovered_applied = cmp::max(snapshot_point.map(|p| p.index), applied_index);
        let latest_index = latest_entry_metadata.map(|(_, i)| i);
        let recovered_applied = cmp::min(recovered_applied, latest_index);

        slog::info!(
            logger,
            "Recovered log. Latest: {:?}, Snapshot: {:?}, Applied: {:?}",
            latest_entry_metadata,
            snapshot_point,
            recovered_applied
        );

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            snapshot_point,
            commit_stream,
            commit_index: recovered_applied,
            last_applied_index: recovered_applied,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    /// Lowest index still readable from the log.
    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn snapshot_point(&self) -> Option<SnapshotPoint> {
        self.snapshot_point
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        match self.read(index)? {
            Some(entry) => Ok(entry),
            None => Err(io::Error::new(
                ErrorKind::NotFound,
                format!("No log entry for index {:?}", index),
            )),
        }
    }

    /// Term of the entry at `index`, including the entry the snapshot point stands in for. None
    /// if we don't have it, or it has been compacted away.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some(point) = self.snapshot_point {
            if point.index == index {
                return Ok(Some(point.term));
            }
        }
        Ok(self.read(index)?.map(|entry| entry.term))
    }

    /// Up to `max_entries` consecutive entries starting at `start`. Stops early at the end of the
    /// log.
    pub(crate) fn read_batch(&self, start: Index, max_entries: usize) -> Result<Vec<WriteAheadLogEntry>, io::Error> {
        let mut entries = Vec::new();
        let mut index = start;
        while entries.len() < max_entries {
            match self.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.plus(1);
        }
        Ok(entries)
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if let Some(commit_index) = self.commit_index {
            if index <= commit_index {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("Refusing to truncate committed entry {:?} (commit {:?})", index, commit_index),
                ));
            }
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .term_at(new_latest_entry_index)?
                .map(|term| (term, new_latest_entry_index));
        }

        self.log.truncate(index)?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<(), io::Error> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(());
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let entry = self.read_required(tentative_new_commit_index)?;
        if entry.term != current_term {
            return Ok(());
        }

        self.ratchet_fwd_commit_index(tentative_new_commit_index);

        Ok(())
    }

    /// Followers learn the commit index from the leader. A leader that was just elected may still
    /// report a lower one than we already know, which is ignored.
    pub(crate) fn ratchet_fwd_commit_index_if_changed(&mut self, new_commit_index: Index) {
        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return;
        }

        self.ratchet_fwd_commit_index(new_commit_index);
    }

    fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) {
        // Assert we only mark as committed if we have the entry locally.
        let has_entry_locally = matches!(
            self.latest_entry_metadata,
            Some((_, latest_index)) if latest_index >= new_commit_index
        );
        assert!(
            has_entry_locally,
            "Can't ratchet commit index forwards past our local log. Latest: {:?}, Input: {:?}",
            self.latest_entry_metadata,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// apply_all_committed_entries publishes all committed but unapplied entries in order.
    pub(crate) fn apply_all_committed_entries(&mut self) {
        if let Err(e) = self.try_apply_all_committed_entries() {
            // We've already persisted the log. Applying committed logs is not on critical
            // path. We can wait to retry next time.
            slog::error!(self.logger, "Failed to apply a log entry. {:?}", e);
        }
    }

    fn try_apply_all_committed_entries(&mut self) -> Result<(), io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(()),
        };

        // This may be a long running loop, and starve the Replica event loop from handling
        // another event. Given this path is for followers catching up, it would only be on the
        // critical path for redirecting caller or taking over leadership.
        loop {
            let next_index = match self.last_applied_index {
                Some(applied) if applied >= commit_index => return Ok(()),
                Some(applied) => applied.plus(1),
                None => Index::start_index(),
            };
            self.apply_single_entry(next_index)?;
            self.last_applied_index.replace(next_index);
        }
    }

    fn apply_single_entry(&mut self, index_to_apply: Index) -> Result<(), io::Error> {
        let entry = self.read_required(index_to_apply)?;

        self.commit_stream
            .notify_commit(&self.logger, entry.term, index_to_apply, Bytes::from(entry.data));

        Ok(())
    }

    /// Drops the log prefix the FSM's snapshot at `point` covers. Never drops unapplied entries.
    pub(crate) fn compact_through(&mut self, point: SnapshotPoint) -> Result<bool, io::Error> {
        let applied = match self.last_applied_index {
            Some(applied) if applied >= point.index => applied,
            _ => return Ok(false),
        };
        if matches!(self.snapshot_point, Some(existing) if existing.index >= point.index) {
            return Ok(true);
        }

        self.log.compact(point.index)?;
        self.snapshot_point = Some(point);
        slog::info!(self.logger, "Compacted log through {:?} (applied {:?})", point.index, applied);
        Ok(true)
    }

    /// Replaces the whole log with a snapshot received from the leader. Returns false if we had
    /// already committed past it.
    pub(crate) fn install_snapshot(&mut self, point: SnapshotPoint) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if ci >= point.index) {
            return Ok(false);
        }

        self.log.reset(point.index.plus(1))?;
        self.latest_entry_metadata = Some((point.term, point.index));
        self.snapshot_point = Some(point);
        self.commit_index = Some(point.index);
        self.last_applied_index = Some(point.index);
        self.commit_stream.notify_snapshot(&self.logger, point);

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::Log as _;
    use crate::commitlog::InMemoryLog;
    use crate::replica::write_ahead_log::commit_stream::{self, CommitStream, Committed};
    use slog::Drain;

    fn test_logger() -> slog::Logger {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog::Logger::root(drain, slog::o!())
    }

    fn entry(term: u64, data: &[u8]) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            data: data.to_vec(),
        }
    }

    fn new_wal(
        log: InMemoryLog<WriteAheadLogEntry>,
        snapshot_point: Option<SnapshotPoint>,
        applied: Option<Index>,
    ) -> (WriteAheadLog<InMemoryLog<WriteAheadLogEntry>>, CommitStream) {
        let (publisher, stream) = commit_stream::new();
        let wal = WriteAheadLog::new(test_logger(), log, publisher, snapshot_point, applied).unwrap();
        (wal, stream)
    }

    async fn next_entry_index(stream: &mut CommitStream) -> u64 {
        match stream.recv().await {
            Some(Committed::Entry(e)) => e.index.as_u64(),
            other => panic!("Expected entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn publishes_committed_entries_once() {
        let (mut wal, mut stream) = new_wal(InMemoryLog::create().unwrap(), None, None);
        for i in 0..3 {
            wal.append(entry(1, &[i])).unwrap();
        }

        wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(1)).unwrap();
        wal.apply_all_committed_entries();
        wal.apply_all_committed_entries();
        assert_eq!(next_entry_index(&mut stream).await, 1);
        assert_eq!(next_entry_index(&mut stream).await, 2);

        // Stale commit index from a new leader is ignored.
        wal.ratchet_fwd_commit_index_if_changed(Index::new(1));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));

        wal.ratchet_fwd_commit_index_if_changed(Index::new(3));
        wal.apply_all_committed_entries();
        assert_eq!(next_entry_index(&mut stream).await, 3);
    }

    #[test]
    fn only_commits_entries_from_current_term() {
        let (mut wal, _stream) = new_wal(InMemoryLog::create().unwrap(), None, None);
        wal.append(entry(1, b"a")).unwrap();
        wal.append(entry(2, b"b")).unwrap();

        wal.ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(2)).unwrap();
        assert_eq!(wal.commit_index(), None);
        wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap();
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
    }

    #[test]
    fn recovers_from_existing_log() {
        let mut log = InMemoryLog::create().unwrap();
        log.append(entry(1, b"a")).unwrap();
        log.append(entry(3, b"b")).unwrap();
        log.append(entry(3, b"c")).unwrap();

        let (wal, _stream) = new_wal(log, None, Some(Index::new(2)));
        assert_eq!(wal.latest_entry(), Some((Term::new(3), Index::new(3))));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
        assert_eq!(wal.last_applied_index(), Some(Index::new(2)));
    }

    #[test]
    fn refuses_to_truncate_committed() {
        let (mut wal, _stream) = new_wal(InMemoryLog::create().unwrap(), None, None);
        wal.append(entry(1, b"a")).unwrap();
        wal.append(entry(1, b"b")).unwrap();
        wal.ratchet_fwd_commit_index_if_changed(Index::new(1));

        assert!(wal.truncate(Index::new(1)).is_err());
        wal.truncate(Index::new(2)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(1), Index::new(1))));
    }

    #[tokio::test]
    async fn compaction_keeps_snapshot_term() {
        let (mut wal, mut stream) = new_wal(InMemoryLog::create().unwrap(), None, None);
        for term in &[1, 1, 2, 2] {
            wal.append(entry(*term, b"x")).unwrap();
        }
        let point = SnapshotPoint {
            term: Term::new(2),
            index: Index::new(3),
        };

        // Not applied yet.
        assert!(!wal.compact_through(point).unwrap());

        wal.ratchet_fwd_commit_index_if_changed(Index::new(3));
        wal.apply_all_committed_entries();
        for _ in 0..3 {
            next_entry_index(&mut stream).await;
        }
        assert!(wal.compact_through(point).unwrap());

        assert_eq!(wal.first_index(), Index::new(4));
        assert_eq!(wal.term_at(Index::new(3)).unwrap(), Some(Term::new(2)));
        assert_eq!(wal.term_at(Index::new(2)).unwrap(), None);
        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(4))));
    }

    #[tokio::test]
    async fn install_snapshot_replaces_log() {
        let (mut wal, mut stream) = new_wal(InMemoryLog::create().unwrap(), None, None);
        wal.append(entry(1, b"stale")).unwrap();

        let point = SnapshotPoint {
            term: Term::new(4),
            index: Index::new(10),
        };
        assert!(wal.install_snapshot(point).unwrap());
        assert!(matches!(stream.recv().await, Some(Committed::Snapshot(p)) if p == point));

        assert_eq!(wal.latest_entry(), Some((Term::new(4), Index::new(10))));
        assert_eq!(wal.commit_index(), Some(Index::new(10)));
        assert_eq!(wal.append(entry(4, b"next")).unwrap(), Index::new(11));

        // Older snapshot is ignored.
        assert!(!wal.install_snapshot(point).unwrap());
    }

    #[test]
    fn recovery_resets_log_behind_snapshot() {
        let mut log = InMemoryLog::create().unwrap();
        log.append(entry(1, b"a")).unwrap();
        let point = SnapshotPoint {
            term: Term::new(2),
            index: Index::new(5),
        };

        let (mut wal, _stream) = new_wal(log, Some(point), None);
        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(5))));
        assert_eq!(wal.last_applied_index(), Some(Index::new(5)));
        assert_eq!(wal.append(entry(2, b"b")).unwrap(), Index::new(6));
    }
}
