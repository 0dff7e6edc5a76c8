//! The record: the unit of storage throughout the engine.
//!
//! A record is a `(key, kind, value, seq)` tuple. Tombstones are
//! `Delete` records with an empty value; they mask older versions of
//! the key in lower levels until compaction at the deepest level drops
//! them. The sequence number is assigned by the engine at write time
//! and decides recency wherever the same key appears in more than one
//! source.
//!
//! Two encodings exist, both little-endian with varint length prefixes:
//!
//! WAL frame payload:
//! ```text
//! [op: u8][key_len: varint][key][value_len: varint][value][seq: u64]
//! ```
//!
//! Table record:
//! ```text
//! [op: u8][seq: u64][key_len: varint][key][value_len: varint][value]
//! ```

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::codec;
use crate::error::{Error, Result};

/// Upper bound applied when decoding length prefixes from disk. Keys and
/// values past the configured limits never get written, so anything
/// larger than this is corruption, not data.
const DECODE_CAP: usize = 256 * 1024 * 1024;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Put,
    Delete,
}

impl RecordKind {
    fn from_op(op: u8) -> Result<Self> {
        match op {
            OP_PUT => Ok(RecordKind::Put),
            OP_DELETE => Ok(RecordKind::Delete),
            other => Err(Error::Corruption(format!("invalid record op {}", other))),
        }
    }

    fn op(self) -> u8 {
        match self {
            RecordKind::Put => OP_PUT,
            RecordKind::Delete => OP_DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub seq: u64,
    pub kind: RecordKind,
}

impl Record {
    pub fn put(key: Vec<u8>, value: Vec<u8>, seq: u64) -> Self {
        Self {
            key,
            value,
            seq,
            kind: RecordKind::Put,
        }
    }

    pub fn tombstone(key: Vec<u8>, seq: u64) -> Self {
        Self {
            key,
            value: Vec::new(),
            seq,
            kind: RecordKind::Delete,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == RecordKind::Delete
    }

    /// Encoded key + value footprint, used for memtable size accounting.
    pub fn payload_bytes(&self) -> usize {
        self.key.len() + self.value.len()
    }

    /// Encodes the record as a WAL frame payload.
    pub fn encode_wal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.payload_bytes() + 2 * codec::MAX_VARINT_LEN + 8);
        buf.push(self.kind.op());
        codec::write_len_prefixed(&mut buf, &self.key);
        codec::write_len_prefixed(&mut buf, &self.value);
        buf.write_u64::<LittleEndian>(self.seq).unwrap();
        buf
    }

    /// Decodes a WAL frame payload. The payload has already passed its
    /// CRC check, so failures here mean a frame was framed incorrectly.
    pub fn decode_wal(payload: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(payload);

        let mut op = [0u8; 1];
        cursor.read_exact(&mut op)?;
        let kind = RecordKind::from_op(op[0])?;

        let key = codec::read_len_prefixed(&mut cursor, DECODE_CAP)?;
        let value = codec::read_len_prefixed(&mut cursor, DECODE_CAP)?;
        let seq = cursor.read_u64::<LittleEndian>()?;

        if cursor.position() as usize != payload.len() {
            return Err(Error::Corruption(
                "trailing bytes in WAL frame payload".to_string(),
            ));
        }
        if kind == RecordKind::Delete && !value.is_empty() {
            return Err(Error::Corruption(
                "tombstone frame carries a value".to_string(),
            ));
        }

        Ok(Self {
            key,
            value,
            seq,
            kind,
        })
    }

    /// Appends the record in table encoding to the buffer, returning the
    /// encoded length.
    pub fn encode_table(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        buf.push(self.kind.op());
        buf.write_u64::<LittleEndian>(self.seq).unwrap();
        codec::write_len_prefixed(buf, &self.key);
        codec::write_len_prefixed(buf, &self.value);
        buf.len() - start
    }

    /// Reads one table record from a reader positioned at a record
    /// boundary. Returns `Ok(None)` at clean end of input.
    pub fn read_table<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut op = [0u8; 1];
        match reader.read_exact(&mut op) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let kind = RecordKind::from_op(op[0])?;

        let seq = reader.read_u64::<LittleEndian>()?;
        let key = codec::read_len_prefixed(reader, DECODE_CAP)?;
        let value = codec::read_len_prefixed(reader, DECODE_CAP)?;

        if kind == RecordKind::Delete && !value.is_empty() {
            return Err(Error::Corruption(
                "tombstone record carries a value".to_string(),
            ));
        }

        Ok(Some(Self {
            key,
            value,
            seq,
            kind,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_roundtrip() {
        let records = vec![
            Record::put(b"apple".to_vec(), b"1".to_vec(), 7),
            Record::put(b"".to_vec(), b"".to_vec(), 0),
            Record::tombstone(b"banana".to_vec(), u64::MAX),
        ];

        for record in records {
            let encoded = record.encode_wal();
            let decoded = Record::decode_wal(&encoded).expect("decode failed");
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_wal_rejects_trailing_bytes() {
        let mut encoded = Record::put(b"k".to_vec(), b"v".to_vec(), 1).encode_wal();
        encoded.push(0xAB);
        assert!(matches!(
            Record::decode_wal(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_wal_rejects_invalid_op() {
        let mut encoded = Record::put(b"k".to_vec(), b"v".to_vec(), 1).encode_wal();
        encoded[0] = 9;
        assert!(matches!(
            Record::decode_wal(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_table_roundtrip() {
        let records = vec![
            Record::put(b"key_1".to_vec(), b"value_1".to_vec(), 10),
            Record::tombstone(b"key_2".to_vec(), 11),
            Record::put(b"key_3".to_vec(), vec![0u8; 1000], 12),
        ];

        let mut buf = Vec::new();
        for record in &records {
            record.encode_table(&mut buf);
        }

        let mut cursor = std::io::Cursor::new(&buf);
        for expected in &records {
            let decoded = Record::read_table(&mut cursor)
                .expect("read failed")
                .expect("unexpected end");
            assert_eq!(&decoded, expected);
        }
        assert!(Record::read_table(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_tombstone_has_empty_value() {
        let tombstone = Record::tombstone(b"key".to_vec(), 1);
        assert!(tombstone.is_tombstone());
        assert!(tombstone.value.is_empty());
    }
}
