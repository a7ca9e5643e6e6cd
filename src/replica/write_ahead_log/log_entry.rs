use crate::commitlog;
use crate::replica::Term;
use std::convert::{TryFrom, TryInto};
use std::io::{self, ErrorKind};

/// Byte representation:
///
/// ```text
/// |                                         1                           |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|       Term (8 bytes)          |   Data (variable size)      ... |
/// +---+-------------------------------+-----------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created, little endian
/// * `Data` - an encoded FSM command. Empty for the no-op a new leader appends.
///
/// Not needed:
///
/// * Checksum is not needed. The entry is sealed with an AEAD before it reaches disk.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub term: Term,
    pub data: Vec<u8>,
}

const WAL_ENTRY_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 9;

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(mut bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("Log entry is {} bytes, shorter than its header", bytes.len()),
            ));
        }
        if bytes[0] != WAL_ENTRY_FORMAT_VERSION {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("Unknown log entry version {}", bytes[0]),
            ));
        }

        let term_bytes: [u8; 8] = bytes[1..HEADER_LEN]
            .try_into()
            .map_err(|_| io::Error::new(ErrorKind::InvalidData, "Bad term bytes"))?;
        let data = bytes.split_off(HEADER_LEN);

        Ok(WriteAheadLogEntry {
            term: Term::new(u64::from_le_bytes(term_bytes)),
            data,
        })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut bytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + entry.data.len());
        bytes.push(WAL_ENTRY_FORMAT_VERSION);
        bytes.extend_from_slice(&entry.term.as_u64().to_le_bytes());
        bytes.extend_from_slice(&entry.data);
        bytes
    }
}
