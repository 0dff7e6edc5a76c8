//! Operation counters and the snapshot returned by `Engine::stats`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters updated by the hot paths. Relaxed ordering is
/// enough; these are observability numbers, not synchronization.
#[derive(Debug, Default)]
pub struct Counters {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub deletes: AtomicU64,
    pub scans: AtomicU64,
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    pub bytes_compacted: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}

/// Point-in-time view of the engine, safe to hand to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub scans: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub bytes_compacted: u64,

    pub memtable_bytes: usize,
    pub memtable_entries: usize,
    pub frozen_memtables: usize,
    pub wal_bytes: u64,

    /// Table count per level, index 0 first.
    pub level_table_counts: Vec<usize>,
    /// Byte size per level, index 0 first.
    pub level_bytes: Vec<u64>,
}

impl Counters {
    /// Copies the counters into a snapshot; the engine fills in the
    /// structural fields.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            bytes_compacted: self.bytes_compacted.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = Counters::new();
        Counters::incr(&counters.puts);
        Counters::incr(&counters.puts);
        Counters::add(&counters.bytes_compacted, 4096);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.puts, 2);
        assert_eq!(snapshot.bytes_compacted, 4096);
        assert_eq!(snapshot.gets, 0);
    }
}
