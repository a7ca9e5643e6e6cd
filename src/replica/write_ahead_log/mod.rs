//! The Raft log: entries tagged with their term, layered over `commitlog`, plus commit and
//! snapshot bookkeeping.

mod commit_stream;
mod log;
mod log_entry;
mod wiring;

pub(crate) use commit_stream::CommitStream;
pub(crate) use commit_stream::Committed;
pub(crate) use commit_stream::CommittedEntry;
pub(crate) use commit_stream::SnapshotPoint;
pub(crate) use log_entry::WriteAheadLogEntry;

pub(super) use log::WriteAheadLog;
pub(super) use wiring::wired;
