//! Flush pipeline: turns the oldest frozen memtable into a level-0
//! table and retires its WAL.
//!
//! The frozen memtable stays in the queue (and thus visible to reads)
//! until its table is durably installed, so a failed flush loses
//! nothing and is simply retried on the next tick.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::filter::to_key_range;
use crate::levels::{self, TableHandle};
use crate::sstable::{Table, TableBuilder};
use crate::state::EngineState;
use crate::stats::Counters;

/// Flushes the oldest frozen memtable, if any. Returns true when a
/// memtable was flushed.
pub fn flush_one(state: &EngineState, config: &EngineConfig) -> Result<bool> {
    if !state.needs_flush() || !state.try_mark_flush_pending() {
        return Ok(false);
    }

    let result = flush_locked(state, config);
    state.mark_flush_completed();
    result
}

fn flush_locked(state: &EngineState, config: &EngineConfig) -> Result<bool> {
    // Clone, don't pop: the memtable must stay readable until its table
    // is installed.
    let memtable = match state.frozen.read()?.front() {
        Some(m) => m.clone(),
        None => return Ok(false),
    };

    let wal_id = memtable.wal_id();
    let core = memtable.memtable();

    if core.is_empty() {
        // Nothing to persist; drop the memtable and its WAL.
        retire(state, wal_id, &core.wal_path());
        return Ok(true);
    }

    let table_id = state.next_table_id();
    let level_dir = levels::level_dir(&config.data_dir, 0);
    std::fs::create_dir_all(&level_dir)?;
    let table_path = levels::table_path(&config.data_dir, 0, table_id);

    let mut builder = TableBuilder::create(
        &table_path,
        core.entries(),
        config.sstable_bloom_fp_rate,
        config.sstable_index_interval,
    )?;

    for entry in memtable.scan(to_key_range::<std::ops::RangeFull>(..)) {
        builder.add(&entry?)?;
    }

    let (meta, size) = builder.finish()?;
    let table = Table::open(&table_path)?;
    let handle = Arc::new(TableHandle {
        id: table_id,
        table,
        path: table_path.clone(),
        size,
    });

    state.levels.write()?.level_mut(0).add(handle);
    retire(state, wal_id, &core.wal_path());

    Counters::incr(&state.counters.flushes);
    tracing::info!(
        table_id = table_id,
        wal_id = wal_id,
        entries = meta.key_count,
        bytes = size,
        "flushed memtable to level 0"
    );

    Ok(true)
}

/// Removes the flushed memtable from the queue and deletes its WAL.
fn retire(state: &EngineState, wal_id: u64, wal_path: &std::path::Path) {
    let mut frozen = state.frozen.write().unwrap();
    if frozen.front().map(|m| m.wal_id()) == Some(wal_id) {
        frozen.pop_front();
    }
    drop(frozen);

    if let Err(e) = std::fs::remove_file(wal_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(wal_id = wal_id, error = %e, "failed to delete flushed WAL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::ActiveMemtable;
    use crate::record::Record;
    use crate::state::EngineState;
    use crate::tmpfs::TempDir;
    use std::collections::VecDeque;

    fn test_setup(dir: &TempDir) -> (EngineState, EngineConfig) {
        let config = EngineConfig::new(dir.path());
        let active = ActiveMemtable::create(dir.path().join("wal.log"), 0, false).unwrap();
        let state = EngineState::new(
            active,
            VecDeque::new(),
            crate::levels::Levels::new(config.max_levels),
            1,
            0,
            1,
        );
        (state, config)
    }

    fn freeze_with_records(state: &EngineState, dir: &TempDir, count: u64) {
        let wal_id = state.next_wal_id();
        let active =
            ActiveMemtable::create(dir.path().join(format!("wal.log.{}", wal_id)), wal_id, false)
                .unwrap();
        for i in 0..count {
            let seq = state.next_seq();
            active
                .put(Record::put(
                    format!("key_{:04}", i).into_bytes(),
                    format!("value_{}", i).into_bytes(),
                    seq,
                ))
                .unwrap();
        }
        let frozen = active.freeze().unwrap();
        state.frozen.write().unwrap().push_back(frozen);
    }

    #[test]
    fn test_flush_nothing_pending() {
        let dir = TempDir::new().expect("temp dir");
        let (state, config) = test_setup(&dir);
        assert!(!flush_one(&state, &config).unwrap());
    }

    #[test]
    fn test_flush_installs_level0_table() {
        let dir = TempDir::new().expect("temp dir");
        let (state, config) = test_setup(&dir);
        freeze_with_records(&state, &dir, 50);

        assert!(flush_one(&state, &config).unwrap());

        let levels = state.levels.read().unwrap();
        assert_eq!(levels.level(0).table_count(), 1);
        let handle = &levels.level(0).tables[0];
        assert_eq!(handle.key_count(), 50);

        // Data is served from the table.
        let record = levels.level(0).get(b"key_0007").unwrap().unwrap();
        assert_eq!(record.value, b"value_7");

        // Frozen queue drained, WAL removed.
        drop(levels);
        assert!(state.frozen.read().unwrap().is_empty());
        assert!(!dir.path().join("wal.log.1").exists());
    }

    #[test]
    fn test_flush_preserves_tombstones() {
        let dir = TempDir::new().expect("temp dir");
        let (state, config) = test_setup(&dir);

        let wal_id = state.next_wal_id();
        let active =
            ActiveMemtable::create(dir.path().join(format!("wal.log.{}", wal_id)), wal_id, false)
                .unwrap();
        active
            .put(Record::put(b"kept".to_vec(), b"v".to_vec(), state.next_seq()))
            .unwrap();
        active
            .put(Record::tombstone(b"gone".to_vec(), state.next_seq()))
            .unwrap();
        state
            .frozen
            .write()
            .unwrap()
            .push_back(active.freeze().unwrap());

        assert!(flush_one(&state, &config).unwrap());

        let levels = state.levels.read().unwrap();
        let tombstone = levels.level(0).get(b"gone").unwrap().unwrap();
        assert!(tombstone.is_tombstone());
    }

    #[test]
    fn test_flush_multiple_in_fifo_order() {
        let dir = TempDir::new().expect("temp dir");
        let (state, config) = test_setup(&dir);
        freeze_with_records(&state, &dir, 10);
        freeze_with_records(&state, &dir, 10);

        assert!(flush_one(&state, &config).unwrap());
        assert!(flush_one(&state, &config).unwrap());
        assert!(!flush_one(&state, &config).unwrap());

        let levels = state.levels.read().unwrap();
        assert_eq!(levels.level(0).table_count(), 2);
        // Newest first in level 0.
        assert!(levels.level(0).tables[0].id > levels.level(0).tables[1].id);
    }
}
