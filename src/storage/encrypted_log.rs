use crate::commitlog::{Entry, Index, Log};
use crate::crypto::KeyRingHandle;
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

/// Ciphertext of one log entry as the inner log stores it.
#[derive(Clone)]
pub struct SealedEntry(Vec<u8>);

impl Entry for SealedEntry {}

impl TryFrom<Vec<u8>> for SealedEntry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(SealedEntry(bytes))
    }
}

impl From<SealedEntry> for Vec<u8> {
    fn from(entry: SealedEntry) -> Self {
        entry.0
    }
}

/// EncryptedLog is a `Log<E>` decorator: entries are serialized, sealed with the active key and
/// appended to the inner log. Reads open them with whichever retained key sealed them.
pub struct EncryptedLog<L, E>
where
    L: Log<SealedEntry>,
    E: Entry,
{
    inner: L,
    key_ring: KeyRingHandle,
    _pd: PhantomData<E>,
}

impl<L, E> EncryptedLog<L, E>
where
    L: Log<SealedEntry>,
    E: Entry,
{
    pub fn new(inner: L, key_ring: KeyRingHandle) -> Self {
        EncryptedLog {
            inner,
            key_ring,
            _pd: PhantomData::default(),
        }
    }
}

impl<L, E> Log<E> for EncryptedLog<L, E>
where
    L: Log<SealedEntry>,
    E: Entry,
{
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let plaintext: Vec<u8> = entry.into();
        let sealed = self.key_ring.seal(&plaintext)?;
        self.inner.append(SealedEntry(sealed))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.inner.read(index)? {
            None => Ok(None),
            Some(SealedEntry(sealed)) => {
                let plaintext = self.key_ring.open(&sealed)?;
                E::try_from(plaintext).map(Some)
            }
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        self.inner.truncate(index)
    }

    fn next_index(&self) -> Index {
        self.inner.next_index()
    }

    fn first_index(&self) -> Index {
        self.inner.first_index()
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        self.inner.compact(through)
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.inner.reset(next_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;
    use std::io::ErrorKind;

    #[derive(Clone, Debug, PartialEq)]
    struct Note(String);

    impl Entry for Note {}

    impl TryFrom<Vec<u8>> for Note {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            String::from_utf8(bytes)
                .map(Note)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
        }
    }

    impl From<Note> for Vec<u8> {
        fn from(note: Note) -> Self {
            note.0.into_bytes()
        }
    }

    #[test]
    fn entries_readable_across_rotation() {
        let ring = KeyRingHandle::ephemeral();
        let mut log: EncryptedLog<_, Note> =
            EncryptedLog::new(InMemoryLog::<SealedEntry>::create().unwrap(), ring.clone());

        log.append(Note("before".into())).unwrap();
        ring.rotate().unwrap();
        log.append(Note("after".into())).unwrap();

        assert_eq!(log.read(Index::new(1)).unwrap(), Some(Note("before".into())));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(Note("after".into())));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
    }

    #[test]
    fn foreign_ciphertext_is_integrity_error() {
        let ours = KeyRingHandle::ephemeral();
        let theirs = KeyRingHandle::ephemeral();

        let mut inner = InMemoryLog::<SealedEntry>::create().unwrap();
        inner
            .append(SealedEntry(theirs.seal(b"hello").unwrap()))
            .unwrap();

        let log: EncryptedLog<_, Note> = EncryptedLog::new(inner, ours);
        let err = log.read(Index::new(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
