//! The engine: routes reads and writes across the memtables and the
//! level hierarchy, rotates memtables, and owns the background workers.
//!
//! # Write Path
//!
//! ```text
//! put/delete -> write gate -> seq -> WAL append (+sync) -> memtable
//!            -> rotation check -> ack
//! ```
//!
//! Writes are serialized by a single gate so sequence order matches
//! acknowledgement order. The ack never waits for a flush: rotation
//! swaps in a fresh memtable and queues the frozen one for the flush
//! worker.
//!
//! # Read Path
//!
//! ```text
//! get -> active memtable -> frozen memtables (newest first)
//!     -> level 0 (newest table first) -> levels >= 1 (binary search)
//! ```
//!
//! The first version found wins; a tombstone hit answers "not found".
//! Reads capture a snapshot of the sources up front and never block
//! writes. A table that fails on the read path is logged and skipped,
//! letting the search continue to older data.

use std::ops::RangeBounds;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::compaction;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::filter::{self, KeyRange};
use crate::flock::FileLock;
use crate::flush;
use crate::iterator::{MergeIterator, RecordIterator};
use crate::levels::{Level, TableHandle};
use crate::memtable::ActiveMemtable;
use crate::record::Record;
use crate::recovery;
use crate::scheduler::Scheduler;
use crate::state::EngineState;
use crate::stats::{Counters, StatsSnapshot};
use crate::tasks::{CompactionTask, FlushTask};

const LOCK_FILE: &str = "emberdb.lock";

pub struct Engine {
    config: EngineConfig,
    state: Arc<EngineState>,
    scheduler: Mutex<Option<Scheduler>>,
    _lock: FileLock,
}

impl Engine {
    /// Opens (or creates) an engine over the configured data directory,
    /// recovering any state left on disk. The directory is locked for
    /// exclusive access; a second engine on the same directory fails
    /// here.
    pub fn open(config: EngineConfig) -> Result<Self> {
        // Compaction always merges into the level below its source, so
        // the hierarchy needs at least levels 0 and 1.
        if config.max_levels < 2 {
            return Err(Error::InvalidInput(format!(
                "max_levels must be at least 2, got {}",
                config.max_levels
            )));
        }

        std::fs::create_dir_all(&config.data_dir)?;
        let lock = FileLock::acquire(config.data_dir.join(LOCK_FILE))
            .map_err(|e| Error::Io(format!("failed to lock data directory: {}", e)))?;

        let state = Arc::new(recovery::recover(&config)?);

        Ok(Self {
            config,
            state,
            scheduler: Mutex::new(None),
            _lock: lock,
        })
    }

    /// Spawns the flush and compaction workers. Must be called from
    /// within a tokio runtime; without it the engine still works, with
    /// maintenance driven by `flush_now`/`compact_now`.
    pub fn start_maintenance(&self) {
        let mut slot = self.scheduler.lock().unwrap();
        if slot.is_some() {
            return;
        }

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(FlushTask::new(
            Arc::clone(&self.state),
            self.config.clone(),
        )));
        scheduler.register(Arc::new(CompactionTask::new(
            Arc::clone(&self.state),
            self.config.clone(),
        )));
        *slot = Some(scheduler);
    }

    /// Inserts or updates a key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.check_key(key)?;
        self.check_value(value)?;

        let _gate = self.state.write_gate.lock()?;
        self.write_record(|seq| Record::put(key.to_vec(), value.to_vec(), seq))?;
        Counters::incr(&self.state.counters.puts);
        self.maybe_rotate();
        Ok(())
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.check_key(key)?;

        let _gate = self.state.write_gate.lock()?;
        self.write_record(|seq| Record::tombstone(key.to_vec(), seq))?;
        Counters::incr(&self.state.counters.deletes);
        self.maybe_rotate();
        Ok(())
    }

    /// Applies a batch of puts under one writer acquisition. Each pair
    /// still gets its own sequence number; rotation is checked once at
    /// the end.
    pub fn batch_put(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        self.check_writable()?;
        for (key, value) in pairs {
            self.check_key(key)?;
            self.check_value(value)?;
        }

        let _gate = self.state.write_gate.lock()?;
        for (key, value) in pairs {
            self.write_record(|seq| Record::put(key.clone(), value.clone(), seq))?;
            Counters::incr(&self.state.counters.puts);
        }
        self.maybe_rotate();
        Ok(())
    }

    /// Looks up a key. `Ok(None)` means not found, including the case
    /// where the newest version is a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Counters::incr(&self.state.counters.gets);

        let (active, frozen, levels) = self.state.read_snapshot();

        if let Some(versioned) = active.get(key) {
            return Ok(versioned.value);
        }
        for memtable in &frozen {
            if let Some(versioned) = memtable.get(key) {
                return Ok(versioned.value);
            }
        }

        for level in levels.iter() {
            if let Some(record) = search_level(level, key) {
                return Ok(match record.is_tombstone() {
                    true => None,
                    false => Some(record.value),
                });
            }
        }

        Ok(None)
    }

    /// Ordered scan over a key range. The snapshot is captured here;
    /// writes made while iterating are not observed. Tombstoned keys
    /// are suppressed, and each key appears once with its newest value.
    pub fn scan<R>(&self, range: R) -> Scan
    where
        R: RangeBounds<Vec<u8>>,
    {
        Counters::incr(&self.state.counters.scans);
        let range = filter::to_key_range(range);

        let (active, frozen, levels) = self.state.read_snapshot();

        let mut sources: Vec<RecordIterator> = Vec::new();
        sources.push(Box::new(active.scan(range.clone())));
        for memtable in &frozen {
            sources.push(Box::new(memtable.scan(range.clone())));
        }

        for level in levels.iter() {
            if level.level_num == 0 {
                for handle in level.intersecting(&range) {
                    sources.push(Box::new(TableScanSource::new(handle, range.clone())));
                }
            } else {
                let tables = level.intersecting(&range);
                if !tables.is_empty() {
                    sources.push(Box::new(LevelScanSource::new(tables, range.clone())));
                }
            }
        }

        Scan {
            merge: MergeIterator::new(sources),
        }
    }

    /// Counter and structure snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.state.counters.snapshot();

        let (active, frozen, levels) = self.state.read_snapshot();
        snapshot.memtable_bytes = active.size();
        snapshot.memtable_entries = active.entries();
        snapshot.frozen_memtables = frozen.len();
        snapshot.wal_bytes = active.memtable().wal_size()
            + frozen.iter().map(|m| m.memtable().wal_size()).sum::<u64>();
        snapshot.level_table_counts = levels.table_counts();
        snapshot.level_bytes = levels.level_sizes();

        snapshot
    }

    /// Runs one flush synchronously. Returns true if a memtable was
    /// flushed.
    pub fn flush_now(&self) -> Result<bool> {
        flush::flush_one(&self.state, &self.config)
    }

    /// Runs one compaction round synchronously. Returns true if a merge
    /// ran.
    pub fn compact_now(&self) -> Result<bool> {
        compaction::compact(&self.state, &self.config)
    }

    /// Freezes the active memtable regardless of thresholds, queueing
    /// it for flush. No-op when the memtable is empty.
    pub fn rotate_now(&self) -> Result<()> {
        let _gate = self.state.write_gate.lock()?;
        self.rotate()
    }

    pub fn needs_compaction(&self) -> bool {
        compaction::needs_compaction(&self.state, &self.config)
    }

    /// Stops background work, optionally flushes pending memtables, and
    /// syncs the WAL. The engine must not be used afterwards.
    pub async fn close(&self) -> Result<()> {
        self.state.shutdown.store(true, Ordering::SeqCst);

        let scheduler = self.scheduler.lock().unwrap().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await?;
        }

        if self.config.flush_on_close && !self.state.is_degraded() {
            {
                let _gate = self.state.write_gate.lock()?;
                self.rotate()?;
            }
            while flush::flush_one(&self.state, &self.config)? {}
        }

        let active = self.state.active.read()?.clone();
        active.memtable().sync_wal()?;

        tracing::info!("engine closed");
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.state.is_degraded() {
            return Err(Error::ReadOnly);
        }
        if self.state.is_shutting_down() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.config.max_key_bytes {
            return Err(Error::InvalidInput(format!(
                "key length {} exceeds limit {}",
                key.len(),
                self.config.max_key_bytes
            )));
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.config.max_value_bytes {
            return Err(Error::InvalidInput(format!(
                "value length {} exceeds limit {}",
                value.len(),
                self.config.max_value_bytes
            )));
        }
        Ok(())
    }

    /// Assigns a sequence number and applies the record. Must hold the
    /// write gate. A WAL failure degrades the engine: the write is not
    /// acknowledged and later writes are refused.
    fn write_record(&self, make: impl FnOnce(u64) -> Record) -> Result<()> {
        let seq = self.state.next_seq();
        let active = self.state.active.read()?.clone();

        match active.put(make(seq)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.degraded.store(true, Ordering::SeqCst);
                tracing::error!(error = %e, "WAL write failed, engine degraded to read-only");
                Err(e)
            }
        }
    }

    /// Rotation check after an insert. Must hold the write gate.
    /// Rotation is deferred while the frozen queue is full; writes keep
    /// landing in the oversized active memtable instead of blocking.
    fn maybe_rotate(&self) {
        let active = self.state.active.read().unwrap().clone();
        if active.size() < self.config.memtable_max_bytes
            && active.entries() < self.config.memtable_max_entries
        {
            return;
        }

        if self.state.frozen.read().unwrap().len() >= self.config.max_frozen_memtables {
            tracing::debug!("rotation deferred, frozen memtable queue is full");
            return;
        }

        if let Err(e) = self.rotate() {
            tracing::error!(error = %e, "memtable rotation failed");
        }
    }

    /// Swaps in a fresh memtable + WAL and queues the frozen one. Must
    /// hold the write gate.
    fn rotate(&self) -> Result<()> {
        let old = self.state.active.read()?.clone();
        if old.entries() == 0 {
            return Ok(());
        }

        let frozen = old.freeze()?;
        let frozen_wal_id = frozen.wal_id();
        let frozen_bytes = frozen.memtable().size();
        frozen.memtable().sync_wal()?;
        frozen.memtable().rename_wal(
            self.config
                .data_dir
                .join(format!("{}.{}", recovery::ACTIVE_WAL, frozen_wal_id)),
        )?;

        let new_wal_id = self.state.next_wal_id();
        let new_active = ActiveMemtable::create(
            self.config.data_dir.join(recovery::ACTIVE_WAL),
            new_wal_id,
            self.config.wal_sync_on_write,
        )?;

        // Queue before swapping: a reader that already observes the
        // fresh active memtable must find the frozen one in the queue.
        self.state.frozen.write()?.push_back(frozen);
        *self.state.active.write()? = Arc::new(new_active);

        tracing::debug!(
            frozen_wal_id = frozen_wal_id,
            new_wal_id = new_wal_id,
            frozen_bytes = frozen_bytes,
            "rotated memtable"
        );
        Ok(())
    }
}

/// Searches one level for a key, skipping tables that fail to read so
/// older data stays reachable past a corrupt file.
fn search_level(level: &Level, key: &[u8]) -> Option<Record> {
    if level.level_num == 0 {
        for handle in &level.tables {
            if !handle.table.meta().covers(key) {
                continue;
            }
            match handle.table.get(key) {
                Ok(Some(record)) => return Some(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        table_id = handle.id,
                        error = %e,
                        "skipping unreadable table during lookup"
                    );
                }
            }
        }
        return None;
    }

    let handle = level.find(key)?;
    match handle.table.get(key) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(
                table_id = handle.id,
                error = %e,
                "skipping unreadable table during lookup"
            );
            None
        }
    }
}

/// Chains the disjoint tables of one level >= 1 in key order.
struct LevelScanSource {
    tables: std::collections::VecDeque<Arc<TableHandle>>,
    current: Option<crate::sstable::table::ScanIterator>,
    range: KeyRange,
}

impl LevelScanSource {
    fn new(tables: Vec<Arc<TableHandle>>, range: KeyRange) -> Self {
        Self {
            tables: tables.into(),
            current: None,
            range,
        }
    }
}

impl Iterator for LevelScanSource {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                match iter.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }

            let handle = self.tables.pop_front()?;
            match handle.table.scan(self.range.clone()) {
                Ok(iter) => self.current = Some(iter),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// A single level-0 table as a scan source.
struct TableScanSource {
    handle: Arc<TableHandle>,
    range: Option<KeyRange>,
    iter: Option<crate::sstable::table::ScanIterator>,
}

impl TableScanSource {
    fn new(handle: Arc<TableHandle>, range: KeyRange) -> Self {
        Self {
            handle,
            range: Some(range),
            iter: None,
        }
    }
}

impl Iterator for TableScanSource {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.iter.is_none() {
            let range = self.range.take()?;
            match self.handle.table.scan(range) {
                Ok(iter) => self.iter = Some(iter),
                Err(e) => return Some(Err(e)),
            }
        }
        self.iter.as_mut()?.next()
    }
}

/// Ordered iterator over `(key, value)` pairs from a scan snapshot.
/// Corrupt sources are logged and skipped, matching the point-read
/// policy. Dropping the iterator cancels the scan.
pub struct Scan {
    merge: MergeIterator,
}

impl Iterator for Scan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.merge.next()? {
                Ok(record) => {
                    if record.is_tombstone() {
                        continue;
                    }
                    return Some(Ok((record.key, record.value)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable source during scan");
                }
            }
        }
    }
}
