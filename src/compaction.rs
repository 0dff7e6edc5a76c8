//! Size-tiered compaction: merges tables between levels to keep reads
//! fast and reclaim superseded versions.
//!
//! Triggers:
//! - level 0 compacts when its table count reaches the configured
//!   threshold; all level-0 tables plus every overlapping level-1 table
//!   merge into level 1.
//! - level i >= 1 compacts when its byte size exceeds
//!   `level_base_bytes * multiplier^i`; the oldest table plus every
//!   overlapping table in level i+1 merge into level i+1.
//!
//! The merge keeps the highest-seq version of each key. Tombstones are
//! dropped only when the output lands in the deepest level; anywhere
//! else they must survive to mask older versions below. Output rotates
//! to a fresh table at a key boundary once the target size is reached.
//!
//! Installation: outputs are built at temp paths, fsynced, renamed into
//! `level_<i+1>/`, then the in-memory manifest swaps inputs for outputs
//! in one critical section and the input files are unlinked. In-flight
//! reads keep the obsoleted tables alive through their `Arc` handles.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::filter::to_key_range;
use crate::iterator::{MergeIterator, RecordIterator};
use crate::levels::{self, TableHandle};
use crate::sstable::{Table, TableBuilder};
use crate::state::EngineState;
use crate::stats::Counters;

/// How often the merge loop checks for shutdown.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Returns the level that should compact next, if any.
pub fn find_compaction_level(state: &EngineState, config: &EngineConfig) -> Option<usize> {
    let levels = state.levels.read().unwrap();

    // Level 0 can only compact when a level 1 exists to receive it.
    if levels.depth() >= 2 && levels.level(0).table_count() >= config.l0_compaction_threshold {
        return Some(0);
    }

    // The deepest level has nowhere to go.
    for level_num in 1..levels.depth().saturating_sub(1) {
        let level = levels.level(level_num);
        if !level.is_empty() && level.size() > config.level_max_bytes(level_num) {
            return Some(level_num);
        }
    }

    None
}

pub fn needs_compaction(state: &EngineState, config: &EngineConfig) -> bool {
    find_compaction_level(state, config).is_some()
}

/// Runs one compaction round if a level needs it. Returns true when a
/// merge was performed.
pub fn compact(state: &EngineState, config: &EngineConfig) -> Result<bool> {
    let _guard = match state.try_start_compaction() {
        Some(guard) => guard,
        None => return Ok(false),
    };

    let source_level = match find_compaction_level(state, config) {
        Some(level) => level,
        None => return Ok(false),
    };
    let target_level = source_level + 1;

    // Pick inputs under the read lock; handles keep the tables alive
    // after it is released.
    let (source_inputs, target_inputs) = {
        let levels = state.levels.read()?;

        let source_inputs: Vec<Arc<TableHandle>> = if source_level == 0 {
            levels.level(0).tables.clone()
        } else {
            match levels.level(source_level).oldest() {
                Some(handle) => vec![handle],
                None => return Ok(false),
            }
        };
        if source_inputs.is_empty() {
            return Ok(false);
        }

        let min_key = source_inputs.iter().map(|t| t.min_key()).min().unwrap().to_vec();
        let max_key = source_inputs.iter().map(|t| t.max_key()).max().unwrap().to_vec();
        let target_inputs = levels.level(target_level).overlapping(&min_key, &max_key);

        (source_inputs, target_inputs)
    };

    let input_bytes: u64 = source_inputs
        .iter()
        .chain(target_inputs.iter())
        .map(|t| t.size)
        .sum();
    let expected_items: u64 = source_inputs
        .iter()
        .chain(target_inputs.iter())
        .map(|t| t.key_count())
        .sum();

    tracing::info!(
        source_level = source_level,
        target_level = target_level,
        source_tables = source_inputs.len(),
        target_tables = target_inputs.len(),
        input_bytes = input_bytes,
        "starting compaction"
    );

    let mut sources: Vec<RecordIterator> = Vec::new();
    for handle in source_inputs.iter().chain(target_inputs.iter()) {
        let scan = handle.table.scan(to_key_range::<std::ops::RangeFull>(..))?;
        sources.push(Box::new(scan));
    }

    let merged = merge_to_tables(
        state,
        config,
        MergeIterator::new(sources),
        target_level,
        expected_items,
    )?;

    // Open the published outputs before touching the manifest so a
    // failure here leaves the old state fully intact.
    let mut outputs = Vec::with_capacity(merged.len());
    for (id, path) in merged {
        let table = Table::open(&path)?;
        let size = table.size();
        outputs.push(Arc::new(TableHandle {
            id,
            table,
            path,
            size,
        }));
    }

    let source_ids: Vec<u64> = source_inputs.iter().map(|t| t.id).collect();
    let target_ids: Vec<u64> = target_inputs.iter().map(|t| t.id).collect();
    let output_ids: Vec<u64> = outputs.iter().map(|t| t.id).collect();

    {
        let mut levels = state.levels.write()?;
        levels.level_mut(source_level).remove(&source_ids);
        levels.level_mut(target_level).remove(&target_ids);
        for handle in &outputs {
            levels.level_mut(target_level).add(Arc::clone(handle));
        }
    }

    // Unlink inputs only after the manifest no longer references them.
    // Target-level inputs go first: a leftover there would overlap the
    // outputs, which recovery resolves in favor of the newer id.
    for handle in target_inputs.iter().chain(source_inputs.iter()) {
        if let Err(e) = std::fs::remove_file(&handle.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(table_id = handle.id, error = %e, "failed to delete compacted table");
            }
        }
    }

    Counters::incr(&state.counters.compactions);
    Counters::add(&state.counters.bytes_compacted, input_bytes);

    tracing::info!(
        source_level = source_level,
        target_level = target_level,
        inputs = source_ids.len() + target_ids.len(),
        outputs = ?output_ids,
        "completed compaction"
    );

    Ok(true)
}

/// Drains the merge into one or more published tables in the target
/// level, rotating at the size target on key boundaries.
fn merge_to_tables(
    state: &EngineState,
    config: &EngineConfig,
    merge: MergeIterator,
    target_level: usize,
    expected_items: u64,
) -> Result<Vec<(u64, std::path::PathBuf)>> {
    std::fs::create_dir_all(levels::level_dir(&config.data_dir, target_level))?;

    let drop_tombstones = target_level == config.max_levels - 1;
    let mut outputs: Vec<(u64, std::path::PathBuf)> = Vec::new();
    let mut builder: Option<TableBuilder> = None;
    let mut processed: u64 = 0;

    let result = (|| -> Result<()> {
        for entry in merge {
            let record = entry?;

            processed += 1;
            if processed % CANCEL_CHECK_INTERVAL == 0 && state.is_shutting_down() {
                return Err(Error::Canceled);
            }

            if drop_tombstones && record.is_tombstone() {
                continue;
            }

            let full = builder
                .as_ref()
                .is_some_and(|b| b.data_bytes() >= config.sstable_target_bytes);
            if full {
                let finished = builder.take().unwrap();
                let path = finished.final_path().to_path_buf();
                finished.finish()?;
                let id = levels::parse_table_id(&path).expect("output path has an id");
                outputs.push((id, path));
            }

            if builder.is_none() {
                let id = state.next_table_id();
                let path = levels::table_path(&config.data_dir, target_level, id);
                builder = Some(TableBuilder::create(
                    &path,
                    expected_items as usize,
                    config.sstable_bloom_fp_rate,
                    config.sstable_index_interval,
                )?);
            }

            builder.as_mut().unwrap().add(&record)?;
        }

        if let Some(last) = builder.take() {
            if last.key_count() > 0 {
                let path = last.final_path().to_path_buf();
                last.finish()?;
                let id = levels::parse_table_id(&path).expect("output path has an id");
                outputs.push((id, path));
            } else {
                last.discard();
            }
        }

        Ok(())
    })();

    match result {
        Ok(()) => Ok(outputs),
        Err(e) => {
            // Abort: drop the partial output and any finished-but-not-
            // installed tables. Startup also sweeps temp leftovers.
            if let Some(partial) = builder.take() {
                partial.discard();
            }
            for (_, path) in outputs {
                let _ = std::fs::remove_file(&path);
            }
            Err(e)
        }
    }
}
