//! Key-range utilities shared by memtable, table, and merge iterators.

use std::ops::{Bound, RangeBounds};

use crate::error::Result;
use crate::record::Record;

/// Owned key range, the concrete form every internal iterator works on.
pub type KeyRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// Converts any `RangeBounds` over byte keys into the owned form.
pub fn to_key_range<R: RangeBounds<Vec<u8>>>(range: R) -> KeyRange {
    (range.start_bound().cloned(), range.end_bound().cloned())
}

/// True if the key falls inside the range.
pub fn contains(range: &KeyRange, key: &[u8]) -> bool {
    let after_start = match &range.0 {
        Bound::Included(start) => key >= start.as_slice(),
        Bound::Excluded(start) => key > start.as_slice(),
        Bound::Unbounded => true,
    };
    after_start && !beyond_end(range, key)
}

/// True if the key is past the end bound, so a sorted source can stop.
pub fn beyond_end(range: &KeyRange, key: &[u8]) -> bool {
    match &range.1 {
        Bound::Included(end) => key > end.as_slice(),
        Bound::Excluded(end) => key >= end.as_slice(),
        Bound::Unbounded => false,
    }
}

/// True if a table with the given key bounds can hold keys in the range.
pub fn intersects(range: &KeyRange, min_key: &[u8], max_key: &[u8]) -> bool {
    let starts_before_max = match &range.0 {
        Bound::Included(start) => start.as_slice() <= max_key,
        Bound::Excluded(start) => start.as_slice() < max_key,
        Bound::Unbounded => true,
    };
    let ends_after_min = match &range.1 {
        Bound::Included(end) => end.as_slice() >= min_key,
        Bound::Excluded(end) => end.as_slice() > min_key,
        Bound::Unbounded => true,
    };
    starts_before_max && ends_after_min
}

/// An iterator adapter that keeps only records whose keys fall inside a
/// range, terminating early once a sorted source runs past the end.
pub struct RangeFilter<I>
where
    I: Iterator<Item = Result<Record>>,
{
    inner: I,
    range: KeyRange,
}

impl<I> RangeFilter<I>
where
    I: Iterator<Item = Result<Record>>,
{
    pub fn new(inner: I, range: KeyRange) -> Self {
        Self { inner, range }
    }
}

impl<I> Iterator for RangeFilter<I>
where
    I: Iterator<Item = Result<Record>>,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(record) => {
                    if contains(&self.range, &record.key) {
                        return Some(Ok(record));
                    }
                    if beyond_end(&self.range, &record.key) {
                        return None;
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
