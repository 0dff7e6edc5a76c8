//! Table metadata block: key bounds, record count, sequence bounds, and
//! bloom sizing parameters.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::codec;
use crate::error::{Error, Result};

const KEY_CAP: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMeta {
    pub key_count: u64,
    pub seq_min: u64,
    pub seq_max: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub bloom_nbits: u64,
    pub bloom_nhashes: u32,
}

impl TableMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(self.key_count).unwrap();
        buf.write_u64::<LittleEndian>(self.seq_min).unwrap();
        buf.write_u64::<LittleEndian>(self.seq_max).unwrap();
        codec::write_len_prefixed(&mut buf, &self.min_key);
        codec::write_len_prefixed(&mut buf, &self.max_key);
        buf.write_u64::<LittleEndian>(self.bloom_nbits).unwrap();
        buf.write_u32::<LittleEndian>(self.bloom_nhashes).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let key_count = cursor.read_u64::<LittleEndian>()?;
        let seq_min = cursor.read_u64::<LittleEndian>()?;
        let seq_max = cursor.read_u64::<LittleEndian>()?;
        let min_key = codec::read_len_prefixed(&mut cursor, KEY_CAP)?;
        let max_key = codec::read_len_prefixed(&mut cursor, KEY_CAP)?;
        let bloom_nbits = cursor.read_u64::<LittleEndian>()?;
        let bloom_nhashes = cursor.read_u32::<LittleEndian>()?;

        if key_count > 0 && min_key > max_key {
            return Err(Error::Corruption(
                "table metadata has min_key > max_key".to_string(),
            ));
        }

        Ok(Self {
            key_count,
            seq_min,
            seq_max,
            min_key,
            max_key,
            bloom_nbits,
            bloom_nhashes,
        })
    }

    /// True when the key could be inside this table's range.
    pub fn covers(&self, key: &[u8]) -> bool {
        self.key_count > 0 && key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }
}
