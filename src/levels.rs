//! In-memory manifest of the level hierarchy.
//!
//! Each level holds handles to its published tables. Level 0 tables may
//! overlap (they arrive from independent flushes) and are kept ordered
//! by file id descending so reads hit the newest first. Levels >= 1 are
//! built by compaction with disjoint key ranges, kept ordered by min
//! key so a binary search locates the at-most-one table containing a
//! key.
//!
//! The manifest is not persisted; it is reconstructed at startup by
//! listing `level_<i>/*.sst` and reading each table's metadata. Handles
//! are reference counted: readers clone the `Arc`s they need under a
//! short lock and do all I/O without it, so a table obsoleted by
//! compaction stays readable until the last in-flight read drops it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::filter::{self, KeyRange};
use crate::record::Record;
use crate::sstable::Table;

/// A published table plus the identity it carries in the hierarchy.
pub struct TableHandle {
    pub id: u64,
    pub table: Table,
    pub path: PathBuf,
    pub size: u64,
}

impl TableHandle {
    pub fn min_key(&self) -> &[u8] {
        &self.table.meta().min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.table.meta().max_key
    }

    pub fn key_count(&self) -> u64 {
        self.table.meta().key_count
    }

    pub fn seq_max(&self) -> u64 {
        self.table.meta().seq_max
    }

    /// True if this table's key range intersects `[min_key, max_key]`.
    pub fn overlaps(&self, min_key: &[u8], max_key: &[u8]) -> bool {
        self.min_key() <= max_key && min_key <= self.max_key()
    }
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Level {
    pub level_num: usize,
    pub tables: Vec<Arc<TableHandle>>,
}

impl Level {
    pub fn new(level_num: usize) -> Self {
        Self {
            level_num,
            tables: Vec::new(),
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn size(&self) -> u64 {
        self.tables.iter().map(|t| t.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Inserts a table, restoring the level's ordering invariant.
    pub fn add(&mut self, handle: Arc<TableHandle>) {
        self.tables.push(handle);
        if self.level_num == 0 {
            self.tables.sort_by(|a, b| b.id.cmp(&a.id));
        } else {
            self.tables
                .sort_by(|a, b| a.min_key().cmp(b.min_key()));
        }
    }

    pub fn remove(&mut self, ids: &[u64]) {
        self.tables.retain(|t| !ids.contains(&t.id));
    }

    /// Looks up a key in this level. Level 0 checks every covering
    /// table newest-first; deeper levels binary-search the disjoint
    /// ranges. Returns the first record hit, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        if self.level_num == 0 {
            for handle in &self.tables {
                if handle.table.meta().covers(key) {
                    if let Some(record) = handle.table.get(key)? {
                        return Ok(Some(record));
                    }
                }
            }
            return Ok(None);
        }

        match self.find(key) {
            Some(handle) => handle.table.get(key),
            None => Ok(None),
        }
    }

    /// Binary search for the single table whose range can hold `key`.
    /// Only meaningful for levels >= 1.
    pub fn find(&self, key: &[u8]) -> Option<&Arc<TableHandle>> {
        let idx = self
            .tables
            .partition_point(|t| t.min_key() <= key);
        if idx == 0 {
            return None;
        }
        let candidate = &self.tables[idx - 1];
        if candidate.table.meta().covers(key) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Tables whose key ranges intersect the scan range, in key order
    /// for levels >= 1 and newest-first for level 0.
    pub fn intersecting(&self, range: &KeyRange) -> Vec<Arc<TableHandle>> {
        self.tables
            .iter()
            .filter(|t| filter::intersects(range, t.min_key(), t.max_key()))
            .cloned()
            .collect()
    }

    /// Tables overlapping `[min_key, max_key]`, used to pick compaction
    /// inputs in the target level.
    pub fn overlapping(&self, min_key: &[u8], max_key: &[u8]) -> Vec<Arc<TableHandle>> {
        self.tables
            .iter()
            .filter(|t| t.overlaps(min_key, max_key))
            .cloned()
            .collect()
    }

    /// The table with the smallest file id, the preferred compaction
    /// victim for levels >= 1.
    pub fn oldest(&self) -> Option<Arc<TableHandle>> {
        self.tables.iter().min_by_key(|t| t.id).cloned()
    }
}

/// The whole hierarchy. Cloning clones the `Vec`s of `Arc` handles,
/// giving readers an immutable snapshot.
#[derive(Debug, Clone)]
pub struct Levels {
    levels: Vec<Level>,
}

impl Levels {
    pub fn new(max_levels: usize) -> Self {
        Self {
            levels: (0..max_levels).map(Level::new).collect(),
        }
    }

    pub fn level(&self, n: usize) -> &Level {
        &self.levels[n]
    }

    pub fn level_mut(&mut self, n: usize) -> &mut Level {
        &mut self.levels[n]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn table_counts(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.table_count()).collect()
    }

    pub fn level_sizes(&self) -> Vec<u64> {
        self.levels.iter().map(|l| l.size()).collect()
    }

    pub fn max_table_id(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|l| l.tables.iter())
            .map(|t| t.id)
            .max()
            .unwrap_or(0)
    }

    pub fn max_seq(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|l| l.tables.iter())
            .map(|t| t.seq_max())
            .max()
            .unwrap_or(0)
    }
}

/// `<data_dir>/level_<n>`
pub fn level_dir(data_dir: &Path, level: usize) -> PathBuf {
    data_dir.join(format!("level_{}", level))
}

/// `<data_dir>/level_<n>/<id>.sst` with the id zero-padded so listings
/// sort numerically.
pub fn table_path(data_dir: &Path, level: usize, id: u64) -> PathBuf {
    level_dir(data_dir, level).join(format!("{:08}.sst", id))
}

/// Parses the file id out of `<id>.sst`.
pub fn parse_table_id(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}
