//! Sparse index: every Nth record's key mapped to its byte offset in
//! the data section, enabling near-constant positioning before a short
//! linear scan.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::codec;
use crate::error::Result;

/// Bound on index keys when decoding; matches the record decode cap.
const KEY_CAP: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseIndex {
    /// `(key, record offset)` pairs in key order. The first record of a
    /// table is always indexed, so a non-empty table has a non-empty
    /// index whose first key is the table's min key.
    entries: Vec<(Vec<u8>, u64)>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Vec<u8>, offset: u64) {
        self.entries.push((key, offset));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the scan window for a point lookup: the offset of the
    /// greatest indexed key <= `key`, and the offset of the following
    /// index entry (where the linear scan may stop early). `None` when
    /// the key precedes every indexed key.
    pub fn lookup_window(&self, key: &[u8]) -> Option<(u64, Option<u64>)> {
        let idx = self.entries.partition_point(|(k, _)| k.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        let start = self.entries[idx - 1].1;
        let end = self.entries.get(idx).map(|(_, offset)| *offset);
        Some((start, end))
    }

    /// Offset to begin a range scan from: the greatest indexed key <=
    /// `start`, falling back to the first record when `start` precedes
    /// the whole index.
    pub fn scan_start(&self, start: &[u8]) -> u64 {
        match self.lookup_window(start) {
            Some((offset, _)) => offset,
            None => 0,
        }
    }

    /// Serializes as repeated `[key_len: varint][key][offset: u64]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (key, offset) in &self.entries {
            codec::write_len_prefixed(&mut buf, key);
            buf.write_u64::<LittleEndian>(*offset).unwrap();
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut entries = Vec::new();

        while (cursor.position() as usize) < data.len() {
            let key = codec::read_len_prefixed(&mut cursor, KEY_CAP)?;
            let offset = cursor.read_u64::<LittleEndian>()?;
            entries.push((key, offset));
        }

        Ok(Self { entries })
    }
}
