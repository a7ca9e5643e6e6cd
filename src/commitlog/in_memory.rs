use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

/// InMemoryLog keeps the log in RAM. Used in tests and by nodes that don't need durability.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    // Index of `log[0]`.
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: vec![],
            first_index: Index::start_index(),
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some((index.as_u64() - self.first_index.as_u64()) as usize)
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        self.log.push(entry.into());

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        let opt_bytes = self.vec_index(index).and_then(|i| self.log.get(i)).cloned();

        match opt_bytes {
            None => Ok(None),
            Some(bytes) => E::try_from(bytes).map(Some),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let vec_index = self.vec_index(index).unwrap_or(0);
        self.log.truncate(vec_index);
        Ok(())
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        if through < self.first_index {
            return Ok(());
        }

        let drop_count = std::cmp::min(
            (through.as_u64() - self.first_index.as_u64() + 1) as usize,
            self.log.len(),
        );
        self.log.drain(..drop_count);
        self.first_index = std::cmp::max(self.first_index.plus(drop_count as u64), through.plus(1));
        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.log.clear();
        self.first_index = next_index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Blob(Vec<u8>);

    impl Entry for Blob {}

    impl TryFrom<Vec<u8>> for Blob {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(Blob(bytes))
        }
    }

    impl From<Blob> for Vec<u8> {
        fn from(blob: Blob) -> Self {
            blob.0
        }
    }

    fn filled(n: u8) -> InMemoryLog<Blob> {
        let mut log = InMemoryLog::create().unwrap();
        for i in 1..=n {
            log.append(Blob(vec![i])).unwrap();
        }
        log
    }

    #[test]
    fn append_read_truncate() {
        let mut log = filled(3);
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(Blob(vec![2])));
        assert_eq!(log.next_index(), Index::new(4));

        log.truncate(Index::new(2)).unwrap();
        assert_eq!(log.next_index(), Index::new(2));
        assert_eq!(log.read(Index::new(2)).unwrap(), None);
    }

    #[test]
    fn compact_keeps_numbering() {
        let mut log = filled(5);
        log.compact(Index::new(3)).unwrap();

        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(Blob(vec![4])));
        assert_eq!(log.append(Blob(vec![6])).unwrap(), Index::new(6));
    }

    #[test]
    fn reset_jumps_ahead() {
        let mut log = filled(2);
        log.reset(Index::new(10)).unwrap();

        assert_eq!(log.first_index(), Index::new(10));
        assert_eq!(log.next_index(), Index::new(10));
        assert_eq!(log.append(Blob(vec![10])).unwrap(), Index::new(10));
    }
}
