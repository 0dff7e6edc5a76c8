//! K-way merge over sorted record sources.
//!
//! Scans and compactions both need one ordered stream out of many:
//! memtable iterators, per-table iterators, chained per-level
//! iterators. A min-heap keyed on (key ascending, seq descending)
//! always pops the smallest key next, and among versions of the same
//! key the one with the highest sequence number first. Older versions
//! of a yielded key are skipped as they surface, so each distinct key
//! appears exactly once, as its newest version.
//!
//! Tombstones are yielded like any other record; the consumer decides
//! whether to suppress them (scans) or keep them to mask deeper levels
//! (compactions above the deepest level).
//!
//! A source that yields an error is retired from the merge after the
//! error is surfaced once, which lets the read path log and skip a
//! corrupt table while a compaction aborts on the same signal.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::record::Record;

pub type RecordIterator = Box<dyn Iterator<Item = Result<Record>> + Send>;

struct HeapEntry {
    record: Record,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest entry, so "greatest" must mean
    // smallest key; among equal keys, highest seq; then lowest source
    // index for determinism.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.record.key.cmp(&other.record.key) {
            Ordering::Equal => match self.record.seq.cmp(&other.record.seq) {
                Ordering::Equal => self.source.cmp(&other.source).reverse(),
                seq_order => seq_order,
            },
            key_order => key_order.reverse(),
        }
    }
}

pub struct MergeIterator {
    sources: Vec<Option<RecordIterator>>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
    pending_error: Option<crate::error::Error>,
}

impl MergeIterator {
    pub fn new(sources: Vec<RecordIterator>) -> Self {
        let mut merge = Self {
            sources: sources.into_iter().map(Some).collect(),
            heap: BinaryHeap::new(),
            last_key: None,
            pending_error: None,
        };
        for idx in 0..merge.sources.len() {
            merge.advance(idx);
        }
        merge
    }

    /// Pulls the next entry from a source into the heap. A source that
    /// errors is dropped; the error surfaces on the next `next()` call.
    fn advance(&mut self, idx: usize) {
        let Some(source) = self.sources[idx].as_mut() else {
            return;
        };
        match source.next() {
            Some(Ok(record)) => self.heap.push(HeapEntry {
                record,
                source: idx,
            }),
            Some(Err(e)) => {
                self.sources[idx] = None;
                self.pending_error = Some(e);
            }
            None => {
                self.sources[idx] = None;
            }
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.pending_error.take() {
                return Some(Err(e));
            }

            let entry = self.heap.pop()?;
            let source = entry.source;
            self.advance(source);

            // Older version (or duplicate) of a key already yielded.
            if self.last_key.as_deref() == Some(entry.record.key.as_slice()) {
                continue;
            }

            self.last_key = Some(entry.record.key.clone());
            return Some(Ok(entry.record));
        }
    }
}
