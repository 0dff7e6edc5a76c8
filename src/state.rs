//! Shared mutable state for the engine, with fine-grained locking.
//!
//! The write path is serialized by `write_gate`; everything a reader
//! touches is either lock-free (skip lists, published tables) or held
//! only long enough to clone `Arc`s out of it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::levels::Levels;
use crate::memtable::{ActiveMemtable, FrozenMemtable};
use crate::stats::Counters;

pub struct EngineState {
    /// Serializes sequence assignment, WAL append, memtable insert, and
    /// rotation. Readers never take it.
    pub write_gate: Mutex<()>,

    pub active: RwLock<Arc<ActiveMemtable>>,
    pub frozen: RwLock<VecDeque<FrozenMemtable>>,
    pub levels: RwLock<Levels>,

    pub next_seq: AtomicU64,
    pub next_table_id: AtomicU64,
    pub next_wal_id: AtomicU64,

    /// Set when a WAL append fails; further writes are refused until
    /// the engine is reopened.
    pub degraded: AtomicBool,
    /// Set by close(); background work checks it between steps.
    pub shutdown: AtomicBool,

    pub flush_pending: AtomicBool,
    pub compaction_running: AtomicBool,

    pub counters: Counters,
}

impl EngineState {
    pub fn new(
        active: ActiveMemtable,
        frozen: VecDeque<FrozenMemtable>,
        levels: Levels,
        next_seq: u64,
        next_table_id: u64,
        next_wal_id: u64,
    ) -> Self {
        Self {
            write_gate: Mutex::new(()),
            active: RwLock::new(Arc::new(active)),
            frozen: RwLock::new(frozen),
            levels: RwLock::new(levels),
            next_seq: AtomicU64::new(next_seq),
            next_table_id: AtomicU64::new(next_table_id),
            next_wal_id: AtomicU64::new(next_wal_id),
            degraded: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
            compaction_running: AtomicBool::new(false),
            counters: Counters::new(),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_wal_id(&self) -> u64 {
        self.next_wal_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// True when a frozen memtable is waiting and no flush is running.
    pub fn needs_flush(&self) -> bool {
        !self.frozen.read().unwrap().is_empty() && !self.flush_pending.load(Ordering::SeqCst)
    }

    pub fn try_mark_flush_pending(&self) -> bool {
        !self.flush_pending.swap(true, Ordering::SeqCst)
    }

    pub fn mark_flush_completed(&self) {
        self.flush_pending.store(false, Ordering::SeqCst);
    }

    /// Claims the single compaction slot; the guard releases it.
    pub fn try_start_compaction(&self) -> Option<CompactionGuard> {
        if !self.compaction_running.swap(true, Ordering::SeqCst) {
            Some(CompactionGuard { state: self })
        } else {
            None
        }
    }

    /// Snapshot of the read sources for a get or scan: active memtable,
    /// frozen queue newest-first, and the level hierarchy.
    pub fn read_snapshot(&self) -> (Arc<ActiveMemtable>, Vec<FrozenMemtable>, Levels) {
        let active = Arc::clone(&self.active.read().unwrap());
        let frozen: Vec<FrozenMemtable> = self
            .frozen
            .read()
            .unwrap()
            .iter()
            .rev()
            .cloned()
            .collect();
        let levels = self.levels.read().unwrap().clone();
        (active, frozen, levels)
    }
}

/// Releases the compaction slot on drop, including on abort paths.
pub struct CompactionGuard<'a> {
    state: &'a EngineState,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.state.compaction_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn test_state(dir: &TempDir) -> EngineState {
        let active =
            ActiveMemtable::create(dir.path().join("wal.log"), 0, false).expect("memtable");
        EngineState::new(active, VecDeque::new(), Levels::new(3), 1, 0, 1)
    }

    #[test]
    fn test_id_counters_are_monotonic() {
        let dir = TempDir::new().expect("temp dir");
        let state = test_state(&dir);

        assert_eq!(state.next_seq(), 1);
        assert_eq!(state.next_seq(), 2);
        assert_eq!(state.next_table_id(), 0);
        assert_eq!(state.next_table_id(), 1);
        assert_eq!(state.next_wal_id(), 1);
    }

    #[test]
    fn test_flush_pending_is_exclusive() {
        let dir = TempDir::new().expect("temp dir");
        let state = test_state(&dir);

        assert!(state.try_mark_flush_pending());
        assert!(!state.try_mark_flush_pending());
        state.mark_flush_completed();
        assert!(state.try_mark_flush_pending());
    }

    #[test]
    fn test_compaction_slot_is_exclusive() {
        let dir = TempDir::new().expect("temp dir");
        let state = test_state(&dir);

        let guard = state.try_start_compaction().expect("slot free");
        assert!(state.try_start_compaction().is_none());
        drop(guard);
        assert!(state.try_start_compaction().is_some());
    }

    #[test]
    fn test_read_snapshot_clones_sources() {
        let dir = TempDir::new().expect("temp dir");
        let state = test_state(&dir);

        let (active, frozen, levels) = state.read_snapshot();
        assert_eq!(active.entries(), 0);
        assert!(frozen.is_empty());
        assert_eq!(levels.depth(), 3);
    }
}
