use std::convert::TryFrom;
use std::num::NonZeroU64;
use std::{fmt, io};

/// Position of an entry in a [`Log`]. Numbering starts at 1, so "no entry yet" is `Option<Index>`
/// rather than a sentinel.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(NonZeroU64);

impl Index {
    /// Panics on 0.
    pub fn new(index: u64) -> Self {
        match NonZeroU64::new(index) {
            Some(index) => Index(index),
            None => panic!("log indexes start at 1"),
        }
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// `None` for 0, which is how the wire and the on-disk markers spell "no index".
    pub fn from_u64_opt(index: u64) -> Option<Self> {
        NonZeroU64::new(index).map(Index)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn minus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() - delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.as_u64().checked_sub(delta).and_then(Self::from_u64_opt)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An append-only sequence of entries, the storage under the replicated log.
///
/// The first entry lands at index 1. Compaction moves `first_index()` forward; reads below it
/// return `None`.
pub trait Log<E: Entry> {
    /// Writes `entry` at `next_index()` and returns that index.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// None past the end or below `first_index()`.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Drops `index` and everything after it.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    fn next_index(&self) -> Index;

    /// Lowest index still held by the log. Equal to `next_index()` when the log is empty.
    fn first_index(&self) -> Index;

    /// Drops every entry at or below `through`. Used once a snapshot covers them.
    fn compact(&mut self, through: Index) -> Result<(), io::Error>;

    /// Drops everything and continues numbering at `next_index`. Used after installing a
    /// snapshot from the leader.
    fn reset(&mut self, next_index: Index) -> Result<(), io::Error>;
}

/// Something a [`Log`] can store: it round-trips through the bytes written to disk.
pub trait Entry: Clone + TryFrom<Vec<u8>, Error = io::Error> + Into<Vec<u8>> {}
