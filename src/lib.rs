//! emberdb: a persistent, single-node ordered key/value storage engine
//! built on a log-structured merge-tree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐
//! │ Active Memtable │───►│ Frozen Memtables │
//! │   (skip list)   │    │   (flush queue)  │
//! └────────┬────────┘    └────────┬─────────┘
//!          │ WAL                  │ flush
//!          ▼                      ▼
//!     ┌─────────┐          ┌─────────────┐
//!     │ wal.log │          │   Level 0   │  overlapping tables
//!     └─────────┘          └──────┬──────┘
//!                                 │ compaction
//!                                 ▼
//!                          ┌─────────────┐
//!                          │   Level 1+  │  disjoint tables
//!                          └─────────────┘
//! ```
//!
//! Writes land in the WAL and the active memtable; a full memtable is
//! frozen and flushed to a level-0 table by a background worker, and a
//! compaction worker merges tables down the hierarchy. Reads search
//! newest to oldest and stop at the first version of a key, with
//! tombstones masking anything older.
//!
//! # Usage
//!
//! ```no_run
//! use emberdb::{Engine, EngineConfig};
//!
//! # fn main() -> emberdb::Result<()> {
//! let engine = Engine::open(EngineConfig::new("./data"))?;
//! engine.put(b"apple", b"1")?;
//! assert_eq!(engine.get(b"apple")?, Some(b"1".to_vec()));
//! for entry in engine.scan(b"a".to_vec()..b"b".to_vec()) {
//!     let (key, value) = entry?;
//!     println!("{:?} = {:?}", key, value);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod flock;
pub mod flush;
pub mod iterator;
pub mod levels;
pub mod memtable;
pub mod record;
pub mod recovery;
pub mod scheduler;
pub mod sstable;
pub mod state;
pub mod stats;
pub mod tasks;
mod tmpfs;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, Scan};
pub use error::{Error, Result};
pub use record::{Record, RecordKind};
pub use stats::StatsSnapshot;
