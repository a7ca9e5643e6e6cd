//! On-disk snapshot file: a short header, then length-prefixed records. The manifest record comes
//! first, then one record per entity. Record bodies are sealed under the key ring; entity ids are
//! kept in the clear, like entity file names are.
//!
//! ```text
//! "SBSN" | version:u8
//! 0x01 | len:u32 | sealed(manifest json)
//! 0x02 | entity id:[u8; 16] | len:u32 | sealed(entity record json)
//! ...
//! ```

use crate::action::EntityId;
use crate::membership::MemberRecord;
use serde::{Deserialize, Serialize};
use std::convert::TryInto;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use uuid::Uuid;

const MAGIC: &[u8; 4] = b"SBSN";
const VERSION: u8 = 1;
const TAG_MANIFEST: u8 = 1;
const TAG_ENTITY: u8 = 2;
// An entity record is one entity's whole action log. Anything past this is corruption.
const MAX_RECORD_LEN: u32 = 256 * 1024 * 1024;

/// Describes the state a snapshot captures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub last_included_term: u64,
    pub last_included_index: u64,
    pub members: Vec<MemberRecord>,
    pub entity_count: u64,
}

impl SnapshotManifest {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Record {
    Manifest(Vec<u8>),
    Entity(EntityId, Vec<u8>),
}

pub(crate) fn write_header<W: Write>(writer: &mut W) -> Result<(), io::Error> {
    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])
}

pub(crate) fn read_header<R: Read>(reader: &mut R) -> Result<(), io::Error> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if &header[..4] != MAGIC {
        return Err(invalid("Not a snapshot file"));
    }
    if header[4] != VERSION {
        return Err(invalid(format!("Unsupported snapshot version {}", header[4])));
    }
    Ok(())
}

pub(crate) fn write_manifest<W: Write>(writer: &mut W, sealed: &[u8]) -> Result<(), io::Error> {
    writer.write_all(&[TAG_MANIFEST])?;
    write_body(writer, sealed)
}

pub(crate) fn write_entity<W: Write>(writer: &mut W, id: &EntityId, sealed: &[u8]) -> Result<(), io::Error> {
    writer.write_all(&[TAG_ENTITY])?;
    writer.write_all(id.as_uuid().as_bytes())?;
    write_body(writer, sealed)
}

fn write_body<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), io::Error> {
    let len: u32 = body
        .len()
        .try_into()
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "Snapshot record too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)
}

/// Reads the next record. `None` at a clean end of file.
pub(crate) fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>, io::Error> {
    let tag = match read_tag(reader)? {
        None => return Ok(None),
        Some(tag) => tag,
    };

    match tag {
        TAG_MANIFEST => Ok(Some(Record::Manifest(read_body(reader)?))),
        TAG_ENTITY => {
            let id = read_entity_id(reader)?;
            Ok(Some(Record::Entity(id, read_body(reader)?)))
        }
        other => Err(invalid(format!("Unknown snapshot record tag {}", other))),
    }
}

/// Like `read_record()`, but seeks over the body and returns only its first `prefix_len` bytes.
/// Used to read sealed headers without loading entities.
pub(crate) fn skim_record<R: Read + Seek>(reader: &mut R, prefix_len: usize) -> Result<Option<Vec<u8>>, io::Error> {
    let tag = match read_tag(reader)? {
        None => return Ok(None),
        Some(tag) => tag,
    };
    match tag {
        TAG_MANIFEST => {}
        TAG_ENTITY => {
            read_entity_id(reader)?;
        }
        other => return Err(invalid(format!("Unknown snapshot record tag {}", other))),
    }

    let len = read_len(reader)? as usize;
    let take = std::cmp::min(len, prefix_len);
    let mut head = vec![0u8; take];
    reader.read_exact(&mut head)?;
    reader.seek(SeekFrom::Current((len - take) as i64))?;
    Ok(Some(head))
}

fn read_tag<R: Read>(reader: &mut R) -> Result<Option<u8>, io::Error> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag) {
        Ok(()) => Ok(Some(tag[0])),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_entity_id<R: Read>(reader: &mut R) -> Result<EntityId, io::Error> {
    let mut id = [0u8; 16];
    reader.read_exact(&mut id)?;
    Ok(EntityId::from_uuid(Uuid::from_bytes(id)))
}

fn read_len<R: Read>(reader: &mut R) -> Result<u32, io::Error> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_RECORD_LEN {
        return Err(invalid(format!("Snapshot record length {} is implausible", len)));
    }
    Ok(len)
}

fn read_body<R: Read>(reader: &mut R) -> Result<Vec<u8>, io::Error> {
    let len = read_len(reader)?;
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(body)
}

fn invalid<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn records_in_order() {
        let id = EntityId::new_random();
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        write_manifest(&mut buf, b"manifest").unwrap();
        write_entity(&mut buf, &id, b"entity").unwrap();

        let mut cursor = Cursor::new(buf.clone());
        read_header(&mut cursor).unwrap();
        assert_eq!(read_record(&mut cursor).unwrap(), Some(Record::Manifest(b"manifest".to_vec())));
        assert_eq!(read_record(&mut cursor).unwrap(), Some(Record::Entity(id, b"entity".to_vec())));
        assert_eq!(read_record(&mut cursor).unwrap(), None);

        let mut cursor = Cursor::new(buf);
        read_header(&mut cursor).unwrap();
        assert_eq!(skim_record(&mut cursor, 3).unwrap(), Some(b"man".to_vec()));
        assert_eq!(skim_record(&mut cursor, 3).unwrap(), Some(b"ent".to_vec()));
        assert_eq!(skim_record(&mut cursor, 3).unwrap(), None);
    }

    #[test]
    fn garbage_is_rejected() {
        let mut cursor = Cursor::new(b"NOPE\x01".to_vec());
        assert_eq!(read_header(&mut cursor).unwrap_err().kind(), ErrorKind::InvalidData);

        let mut cursor = Cursor::new(vec![9u8, 0, 0, 0, 0]);
        assert_eq!(read_record(&mut cursor).unwrap_err().kind(), ErrorKind::InvalidData);

        // Truncated body.
        let mut cursor = Cursor::new(vec![TAG_MANIFEST, 0, 0, 0, 10, 1, 2]);
        assert_eq!(read_record(&mut cursor).unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }
}
