//! SSTable: the immutable sorted on-disk table produced by flushes and
//! compactions.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------+
//! | Record 1           |
//! | Record 2           |
//! | ...                |  key-sorted, at most one version per key
//! +--------------------+
//! | Index block        |  every Nth key -> record byte offset
//! +--------------------+
//! | Bloom filter block |
//! +--------------------+
//! | Metadata block     |  key bounds, counts, seq bounds, bloom params
//! +--------------------+
//! | Footer (48 bytes)  |  fixed width, read first
//! +--------------------+
//! ```
//!
//! All fixed-width integers are little-endian. The footer carries a
//! magic number and format version plus the offsets and lengths of the
//! three trailer blocks; a reader locates everything from it. A file
//! whose footer or metadata fails validation is unusable and skipped.
//!
//! Tables are built at a temporary path and renamed into place once
//! fully synced, so a published `.sst` file is always complete.

pub mod builder;
pub mod index;
pub mod meta;
pub mod table;

pub use builder::TableBuilder;
pub use meta::TableMeta;
pub use table::Table;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// `EMBRSSTB` interpreted little-endian.
pub const TABLE_MAGIC: u64 = u64::from_le_bytes(*b"EMBRSSTB");
pub const TABLE_VERSION: u32 = 1;

/// Fixed footer width; the last bytes of every table file.
pub const FOOTER_SIZE: usize = 48;

/// Extension used while a table is being built, before the atomic
/// rename that publishes it.
pub const TMP_SUFFIX: &str = "tmp";

/// Locations of the trailer blocks, stored in the fixed-size footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_off: u64,
    pub index_len: u32,
    pub bloom_off: u64,
    pub bloom_len: u32,
    pub meta_off: u64,
    pub meta_len: u32,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.write_u64::<LittleEndian>(TABLE_MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(TABLE_VERSION).unwrap();
        buf.write_u64::<LittleEndian>(self.index_off).unwrap();
        buf.write_u32::<LittleEndian>(self.index_len).unwrap();
        buf.write_u64::<LittleEndian>(self.bloom_off).unwrap();
        buf.write_u32::<LittleEndian>(self.bloom_len).unwrap();
        buf.write_u64::<LittleEndian>(self.meta_off).unwrap();
        buf.write_u32::<LittleEndian>(self.meta_len).unwrap();
        buf.try_into().expect("footer is fixed width")
    }

    pub fn decode(buf: &[u8; FOOTER_SIZE]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(&buf[..]);

        let magic = cursor.read_u64::<LittleEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic {:#018x}",
                magic
            )));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != TABLE_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported table version {}",
                version
            )));
        }

        Ok(Self {
            index_off: cursor.read_u64::<LittleEndian>()?,
            index_len: cursor.read_u32::<LittleEndian>()?,
            bloom_off: cursor.read_u64::<LittleEndian>()?,
            bloom_len: cursor.read_u32::<LittleEndian>()?,
            meta_off: cursor.read_u64::<LittleEndian>()?,
            meta_len: cursor.read_u32::<LittleEndian>()?,
        })
    }
}
