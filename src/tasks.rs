//! The engine's background workers: memtable flushing and level
//! compaction.
//!
//! Both run blocking file I/O, so they execute inside
//! `spawn_blocking`. The compaction task backs off exponentially after
//! repeated failures on the same state (a full disk, a persistently
//! unreadable input) instead of hammering the disk every tick.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::compaction;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::flush;
use crate::scheduler::{BackgroundTask, Context};
use crate::state::EngineState;

const MAX_BACKOFF_EXPONENT: u32 = 6;

pub struct FlushTask {
    state: Arc<EngineState>,
    config: EngineConfig,
}

impl FlushTask {
    pub fn new(state: Arc<EngineState>, config: EngineConfig) -> Self {
        Self { state, config }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memtable-flush"
    }

    fn interval(&self) -> Duration {
        self.config.flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if self.state.is_shutting_down() {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        // Drain the whole queue; each flush is small and bounded.
        tokio::task::spawn_blocking(move || {
            while flush::flush_one(&state, &config)? {}
            Ok(())
        })
        .await?
    }
}

pub struct CompactionTask {
    state: Arc<EngineState>,
    config: EngineConfig,
    consecutive_failures: AtomicU32,
    skip_ticks: AtomicU32,
}

impl CompactionTask {
    pub fn new(state: Arc<EngineState>, config: EngineConfig) -> Self {
        Self {
            state,
            config,
            consecutive_failures: AtomicU32::new(0),
            skip_ticks: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.config.compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if self.state.is_shutting_down() {
            return Ok(());
        }

        // Back-off: skip ticks after repeated failures.
        let skips = self.skip_ticks.load(Ordering::SeqCst);
        if skips > 0 {
            self.skip_ticks.store(skips - 1, Ordering::SeqCst);
            return Ok(());
        }

        if !compaction::needs_compaction(&self.state, &self.config) {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        let result =
            tokio::task::spawn_blocking(move || compaction::compact(&state, &config)).await?;

        match result {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                let failures = self
                    .consecutive_failures
                    .fetch_add(1, Ordering::SeqCst)
                    .saturating_add(1)
                    .min(MAX_BACKOFF_EXPONENT);
                let skip = 2u32.pow(failures) - 1;
                self.skip_ticks.store(skip, Ordering::SeqCst);
                tracing::warn!(
                    failures = failures,
                    backoff_ticks = skip,
                    error = %e,
                    "compaction failed, backing off"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::Levels;
    use crate::memtable::ActiveMemtable;
    use crate::record::Record;
    use crate::tmpfs::TempDir;
    use std::collections::VecDeque;

    fn test_state(dir: &TempDir, config: &EngineConfig) -> Arc<EngineState> {
        let active =
            ActiveMemtable::create(dir.path().join("wal.log"), 0, false).expect("memtable");
        Arc::new(EngineState::new(
            active,
            VecDeque::new(),
            Levels::new(config.max_levels),
            1,
            0,
            1,
        ))
    }

    #[tokio::test]
    async fn test_flush_task_drains_frozen_queue() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let config = EngineConfig::new(dir.path());
        let state = test_state(&dir, &config);

        let active =
            ActiveMemtable::create(dir.path().join("wal.log.1"), 1, false).expect("memtable");
        active
            .put(Record::put(b"k".to_vec(), b"v".to_vec(), 1))
            .unwrap();
        state
            .frozen
            .write()
            .unwrap()
            .push_back(active.freeze().unwrap());

        let task = FlushTask::new(Arc::clone(&state), config);
        task.execute(Context {
            task_name: "memtable-flush",
            run_id: 1,
        })
        .await?;

        assert!(state.frozen.read().unwrap().is_empty());
        assert_eq!(state.levels.read().unwrap().level(0).table_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_compaction_task_noop_when_not_needed() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let config = EngineConfig::new(dir.path());
        let state = test_state(&dir, &config);

        let task = CompactionTask::new(Arc::clone(&state), config);
        task.execute(Context {
            task_name: "compaction",
            run_id: 1,
        })
        .await?;

        assert_eq!(
            state
                .counters
                .compactions
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
        Ok(())
    }
}
