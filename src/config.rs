use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine. Constructed with a data
/// directory and adjusted through the chainable setters; there is no
/// global or process-wide state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for all persistent state.
    pub data_dir: PathBuf,

    /// Memtable byte size that triggers rotation (default: 4MB).
    pub memtable_max_bytes: usize,

    /// Memtable entry count that triggers rotation (default: 100k).
    pub memtable_max_entries: usize,

    /// Largest accepted key (default: 4KB).
    pub max_key_bytes: usize,

    /// Largest accepted value (default: 1MB).
    pub max_value_bytes: usize,

    /// Depth of the level hierarchy, at least 2 (default: 7).
    pub max_levels: usize,

    /// Base for the per-level byte budget; level i compacts past
    /// base * multiplier^i (default: 10MB).
    pub level_base_bytes: u64,

    /// Per-level size growth factor (default: 10).
    pub level_size_multiplier: u64,

    /// Sync the WAL to disk on every append (default: true).
    pub wal_sync_on_write: bool,

    /// One sparse index entry per N records (default: 16).
    pub sstable_index_interval: usize,

    /// Target bloom filter false-positive rate (default: 1%).
    pub sstable_bloom_fp_rate: f64,

    /// Compaction rotates to a new output table past this size
    /// (default: 8MB).
    pub sstable_target_bytes: u64,

    /// Level 0 table count that triggers compaction (default: 4).
    pub l0_compaction_threshold: usize,

    /// Bound on the frozen memtable queue. Rotation is deferred, never
    /// blocked, while the queue is full (default: 2).
    pub max_frozen_memtables: usize,

    /// Flush outstanding memtables when the engine closes (default: true).
    pub flush_on_close: bool,

    /// How often the flush worker checks for frozen memtables
    /// (default: 200ms).
    pub flush_interval: Duration,

    /// How often the compaction worker evaluates levels (default: 1s).
    pub compaction_interval: Duration,
}

impl EngineConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            memtable_max_bytes: 4 * 1024 * 1024,
            memtable_max_entries: 100_000,
            max_key_bytes: 4 * 1024,
            max_value_bytes: 1024 * 1024,
            max_levels: 7,
            level_base_bytes: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            wal_sync_on_write: true,
            sstable_index_interval: 16,
            sstable_bloom_fp_rate: 0.01,
            sstable_target_bytes: 8 * 1024 * 1024,
            l0_compaction_threshold: 4,
            max_frozen_memtables: 2,
            flush_on_close: true,
            flush_interval: Duration::from_millis(200),
            compaction_interval: Duration::from_secs(1),
        }
    }

    pub fn memtable_max_bytes(mut self, bytes: usize) -> Self {
        self.memtable_max_bytes = bytes;
        self
    }

    pub fn memtable_max_entries(mut self, entries: usize) -> Self {
        self.memtable_max_entries = entries;
        self
    }

    pub fn max_key_bytes(mut self, bytes: usize) -> Self {
        self.max_key_bytes = bytes;
        self
    }

    pub fn max_value_bytes(mut self, bytes: usize) -> Self {
        self.max_value_bytes = bytes;
        self
    }

    pub fn max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    pub fn level_base_bytes(mut self, bytes: u64) -> Self {
        self.level_base_bytes = bytes;
        self
    }

    pub fn level_size_multiplier(mut self, multiplier: u64) -> Self {
        self.level_size_multiplier = multiplier;
        self
    }

    pub fn wal_sync_on_write(mut self, enabled: bool) -> Self {
        self.wal_sync_on_write = enabled;
        self
    }

    pub fn sstable_index_interval(mut self, interval: usize) -> Self {
        self.sstable_index_interval = interval;
        self
    }

    pub fn sstable_bloom_fp_rate(mut self, rate: f64) -> Self {
        self.sstable_bloom_fp_rate = rate;
        self
    }

    pub fn sstable_target_bytes(mut self, bytes: u64) -> Self {
        self.sstable_target_bytes = bytes;
        self
    }

    pub fn l0_compaction_threshold(mut self, threshold: usize) -> Self {
        self.l0_compaction_threshold = threshold;
        self
    }

    pub fn max_frozen_memtables(mut self, count: usize) -> Self {
        self.max_frozen_memtables = count;
        self
    }

    pub fn flush_on_close(mut self, enabled: bool) -> Self {
        self.flush_on_close = enabled;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Byte budget for a level: base * multiplier^level. Level 0 is
    /// triggered by table count, not size, so it just gets the base.
    pub fn level_max_bytes(&self, level: usize) -> u64 {
        if level == 0 {
            return self.level_base_bytes;
        }
        self.level_base_bytes
            .saturating_mul(self.level_size_multiplier.saturating_pow(level as u32))
    }
}
