//! Startup recovery: rebuilds the engine state from the data directory.
//!
//! Order of operations:
//! 1. Sweep temp files left by interrupted flushes or compactions.
//! 2. Load every `level_<i>/*.sst`; a table whose footer or metadata
//!    fails validation is logged and skipped, never fatal.
//! 3. In levels >= 1, resolve range overlaps left by a crash between a
//!    compaction's rename and unlink steps: the older (smaller id) of
//!    two overlapping tables is a stale input and is removed.
//! 4. Replay rotated WALs (`wal.log.<id>`) oldest-first into frozen
//!    memtables, then `wal.log` into the active memtable, truncating
//!    torn tails.
//! 5. Seed the sequence, table-id, and wal-id counters past everything
//!    observed, so new writes always win ties.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::levels::{self, Level, Levels, TableHandle};
use crate::memtable::{ActiveMemtable, FrozenMemtable};
use crate::sstable::{Table, TMP_SUFFIX};
use crate::state::EngineState;
use crate::wal::Wal;

pub const ACTIVE_WAL: &str = "wal.log";

pub fn recover(config: &EngineConfig) -> Result<EngineState> {
    std::fs::create_dir_all(&config.data_dir)?;

    sweep_temp_files(&config.data_dir, config.max_levels)?;
    let levels = load_levels(config)?;

    let (active, frozen, next_wal_id) = recover_memtables(config)?;

    let max_seq = levels
        .max_seq()
        .max(active.memtable().max_seq())
        .max(
            frozen
                .iter()
                .map(|m| m.memtable().max_seq())
                .max()
                .unwrap_or(0),
        );
    let next_table_id = levels.max_table_id() + 1;

    tracing::info!(
        levels = levels.depth(),
        tables = levels.table_counts().iter().sum::<usize>(),
        frozen_memtables = frozen.len(),
        next_seq = max_seq + 1,
        "recovery complete"
    );

    Ok(EngineState::new(
        active,
        frozen,
        levels,
        max_seq + 1,
        next_table_id,
        next_wal_id,
    ))
}

/// Removes partial table files from interrupted builds.
fn sweep_temp_files(data_dir: &Path, max_levels: usize) -> Result<()> {
    for level in 0..max_levels {
        let dir = levels::level_dir(data_dir, level);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TMP_SUFFIX) {
                tracing::warn!(path = %path.display(), "removing orphan temp file");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    Ok(())
}

fn load_levels(config: &EngineConfig) -> Result<Levels> {
    let mut levels = Levels::new(config.max_levels);

    for level_num in 0..config.max_levels {
        let dir = levels::level_dir(&config.data_dir, level_num);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sst") {
                continue;
            }
            let Some(id) = levels::parse_table_id(&path) else {
                tracing::warn!(path = %path.display(), "skipping table with unparsable name");
                continue;
            };

            match Table::open(&path) {
                Ok(table) => {
                    let size = table.size();
                    levels.level_mut(level_num).add(Arc::new(TableHandle {
                        id,
                        table,
                        path,
                        size,
                    }));
                }
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable table"
                    );
                }
            }
        }

        if level_num >= 1 {
            remove_stale_overlaps(levels.level_mut(level_num));
        }
    }

    Ok(levels)
}

/// Levels >= 1 must hold disjoint ranges. An overlap means a crash
/// happened after a compaction renamed its outputs but before it
/// unlinked its inputs; the older table of the pair is the stale input.
fn remove_stale_overlaps(level: &mut Level) {
    loop {
        let mut stale: Option<u64> = None;

        for pair in level.tables.windows(2) {
            if pair[1].min_key() <= pair[0].max_key() {
                let older = if pair[0].id < pair[1].id {
                    &pair[0]
                } else {
                    &pair[1]
                };
                stale = Some(older.id);
                tracing::warn!(
                    level = level.level_num,
                    table_id = older.id,
                    "removing stale compaction input overlapping a newer table"
                );
                break;
            }
        }

        match stale {
            Some(id) => {
                if let Some(handle) = level.tables.iter().find(|t| t.id == id) {
                    let _ = std::fs::remove_file(&handle.path);
                }
                level.remove(&[id]);
            }
            None => return,
        }
    }
}

type MemtableRecovery = (ActiveMemtable, VecDeque<FrozenMemtable>, u64);

/// Rebuilds the frozen queue from `wal.log.<id>` files and the active
/// memtable from `wal.log`.
fn recover_memtables(config: &EngineConfig) -> Result<MemtableRecovery> {
    let mut rotated: Vec<(u64, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(&config.data_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(id_str) = name.strip_prefix("wal.log.") {
            if let Ok(id) = id_str.parse::<u64>() {
                rotated.push((id, path));
            }
        }
    }
    rotated.sort_by_key(|(id, _)| *id);

    let mut frozen = VecDeque::new();
    let mut max_wal_id = 0;
    for (id, path) in rotated {
        max_wal_id = max_wal_id.max(id);
        let wal = Wal::open(&path, config.wal_sync_on_write)?;
        let memtable = FrozenMemtable::from_wal(wal, id)?;
        tracing::info!(
            wal_id = id,
            entries = memtable.memtable().entries(),
            "recovered frozen memtable from rotated WAL"
        );
        frozen.push_back(memtable);
    }

    let active_wal_id = max_wal_id + 1;
    let active_path = config.data_dir.join(ACTIVE_WAL);
    let wal = Wal::open(&active_path, config.wal_sync_on_write)?;
    let active = ActiveMemtable::from_wal(wal, active_wal_id)?;
    if active.entries() > 0 {
        tracing::info!(
            entries = active.entries(),
            "recovered active memtable from WAL"
        );
    }

    Ok((active, frozen, active_wal_id + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::sstable::TableBuilder;
    use crate::tmpfs::TempDir;

    fn write_table(config: &EngineConfig, level: usize, id: u64, keys: &[(&str, u64)]) {
        std::fs::create_dir_all(levels::level_dir(&config.data_dir, level)).unwrap();
        let path = levels::table_path(&config.data_dir, level, id);
        let mut builder = TableBuilder::create(&path, keys.len(), 0.01, 4).unwrap();
        for (key, seq) in keys {
            builder
                .add(&Record::put(key.as_bytes().to_vec(), b"v".to_vec(), *seq))
                .unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_recover_empty_directory() {
        let dir = TempDir::new().expect("temp dir");
        let config = EngineConfig::new(dir.path());

        let state = recover(&config).expect("recovery failed");
        assert!(state.frozen.read().unwrap().is_empty());
        assert_eq!(state.levels.read().unwrap().table_counts(), vec![0; 7]);
        assert_eq!(state.active.read().unwrap().entries(), 0);
    }

    #[test]
    fn test_recover_loads_tables_and_seeds_counters() {
        let dir = TempDir::new().expect("temp dir");
        let config = EngineConfig::new(dir.path());

        write_table(&config, 0, 3, &[("a", 10), ("b", 11)]);
        write_table(&config, 1, 1, &[("c", 5)]);

        let state = recover(&config).expect("recovery failed");
        let levels = state.levels.read().unwrap();
        assert_eq!(levels.level(0).table_count(), 1);
        assert_eq!(levels.level(1).table_count(), 1);
        drop(levels);

        // Counters seeded past everything on disk.
        assert_eq!(state.next_table_id(), 4);
        assert_eq!(state.next_seq(), 12);
    }

    #[test]
    fn test_recover_skips_corrupt_table() {
        let dir = TempDir::new().expect("temp dir");
        let config = EngineConfig::new(dir.path());

        write_table(&config, 0, 1, &[("a", 1)]);
        std::fs::create_dir_all(levels::level_dir(dir.path(), 0)).unwrap();
        std::fs::write(levels::table_path(dir.path(), 0, 2), b"not a table").unwrap();

        let state = recover(&config).expect("recovery failed");
        assert_eq!(state.levels.read().unwrap().level(0).table_count(), 1);
    }

    #[test]
    fn test_recover_sweeps_temp_files() {
        let dir = TempDir::new().expect("temp dir");
        let config = EngineConfig::new(dir.path());

        let level_dir = levels::level_dir(dir.path(), 0);
        std::fs::create_dir_all(&level_dir).unwrap();
        let tmp = level_dir.join("00000009.sst.tmp");
        std::fs::write(&tmp, b"partial").unwrap();

        recover(&config).expect("recovery failed");
        assert!(!tmp.exists());
    }

    #[test]
    fn test_recover_drops_stale_overlapping_input() {
        let dir = TempDir::new().expect("temp dir");
        let config = EngineConfig::new(dir.path());

        // A crash between rename and unlink: old table 1 overlaps newer
        // table 5 in level 1.
        write_table(&config, 1, 1, &[("a", 1), ("m", 2)]);
        write_table(&config, 1, 5, &[("c", 8), ("z", 9)]);

        let state = recover(&config).expect("recovery failed");
        let levels = state.levels.read().unwrap();
        assert_eq!(levels.level(1).table_count(), 1);
        assert_eq!(levels.level(1).tables[0].id, 5);
        assert!(!levels::table_path(dir.path(), 1, 1).exists());
    }

    #[test]
    fn test_recover_replays_wals() {
        let dir = TempDir::new().expect("temp dir");
        let config = EngineConfig::new(dir.path()).wal_sync_on_write(false);

        // A rotated WAL and an active WAL.
        let rotated = Wal::open(dir.path().join("wal.log.2"), false).unwrap();
        rotated
            .append(&Record::put(b"frozen_key".to_vec(), b"1".to_vec(), 4))
            .unwrap();
        rotated.sync().unwrap();
        drop(rotated);

        let active = Wal::open(dir.path().join("wal.log"), false).unwrap();
        active
            .append(&Record::put(b"active_key".to_vec(), b"2".to_vec(), 9))
            .unwrap();
        active.sync().unwrap();
        drop(active);

        let state = recover(&config).expect("recovery failed");

        let frozen = state.frozen.read().unwrap();
        assert_eq!(frozen.len(), 1);
        assert_eq!(
            frozen[0].get(b"frozen_key").unwrap().value,
            Some(b"1".to_vec())
        );
        drop(frozen);

        let active = state.active.read().unwrap();
        assert_eq!(
            active.get(b"active_key").unwrap().value,
            Some(b"2".to_vec())
        );

        // Sequence counter is past the highest replayed seq, and the
        // next WAL id is past the rotated one.
        assert_eq!(state.next_seq.load(std::sync::atomic::Ordering::SeqCst), 10);
        assert!(state.next_wal_id.load(std::sync::atomic::Ordering::SeqCst) > 2);
    }
}
