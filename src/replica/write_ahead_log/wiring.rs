use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::write_ahead_log::{commit_stream, SnapshotPoint, WriteAheadLog};
use crate::replica::{CommitStream, WriteAheadLogEntry};
use std::io;

pub(in super::super) fn wired<L>(
    logger: slog::Logger,
    log: L,
    snapshot_point: Option<SnapshotPoint>,
    applied_index: Option<Index>,
) -> Result<(WriteAheadLog<L>, CommitStream), io::Error>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    let (publisher, stream) = commit_stream::new();

    let wal = WriteAheadLog::new(logger, log, publisher, snapshot_point, applied_index)?;

    Ok((wal, stream))
}
