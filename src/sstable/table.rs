//! Table reader: opens a published table, keeps its trailer blocks
//! resident, and serves point lookups and range scans.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::filter::{KeyRange, RangeFilter};
use crate::record::Record;

use super::index::SparseIndex;
use super::meta::TableMeta;
use super::{Footer, FOOTER_SIZE};

pub struct Table {
    file: File,
    path: PathBuf,
    size: u64,
    footer: Footer,
    meta: TableMeta,
    bloom: BloomFilter,
    index: SparseIndex,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.path)
            .field("key_count", &self.meta.key_count)
            .finish()
    }
}

impl Table {
    /// Opens a table file: footer first, then the index, bloom, and
    /// metadata blocks it points at. Any validation failure marks the
    /// file unusable (the caller logs and skips it).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();

        if size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "table file too small ({} bytes)",
                size
            )));
        }

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(size - FOOTER_SIZE as u64))?;
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;

        let trailer_end = footer.meta_off + u64::from(footer.meta_len);
        let blocks_ordered = footer.index_off <= footer.bloom_off
            && footer.bloom_off <= footer.meta_off
            && trailer_end + FOOTER_SIZE as u64 == size;
        if !blocks_ordered {
            return Err(Error::Corruption(
                "table footer block offsets are inconsistent".to_string(),
            ));
        }

        let index_block = read_block(&mut file, footer.index_off, footer.index_len)?;
        let bloom_block = read_block(&mut file, footer.bloom_off, footer.bloom_len)?;
        let meta_block = read_block(&mut file, footer.meta_off, footer.meta_len)?;

        let index = SparseIndex::decode(&index_block)?;
        let bloom = BloomFilter::decode(&bloom_block)?;
        let meta = TableMeta::decode(&meta_block)?;

        if meta.key_count > 0 && index.is_empty() {
            return Err(Error::Corruption(
                "non-empty table has an empty index".to_string(),
            ));
        }

        Ok(Self {
            file,
            path,
            size,
            footer,
            meta,
            bloom,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    /// Point lookup. Returns the full record so the caller can
    /// distinguish a tombstone hit from a miss.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        if !self.meta.covers(key) {
            return Ok(None);
        }
        if !self.bloom.contains(key) {
            return Ok(None);
        }
        let (start, end) = match self.index.lookup_window(key) {
            Some(window) => window,
            None => return Ok(None),
        };
        let end = end.unwrap_or(self.footer.index_off);

        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(start))?;

        // Short linear scan from the indexed record to the next index
        // entry; records are sorted, so passing the key means a miss.
        while reader.stream_position()? < end {
            match Record::read_table(&mut reader)? {
                Some(record) => match record.key.as_slice().cmp(key) {
                    std::cmp::Ordering::Equal => return Ok(Some(record)),
                    std::cmp::Ordering::Greater => return Ok(None),
                    std::cmp::Ordering::Less => continue,
                },
                None => break,
            }
        }
        Ok(None)
    }

    /// Streams records in key order within the range. The index
    /// positions the reader near the first candidate record; the filter
    /// trims the leading partial stride and stops past the end bound.
    pub fn scan(&self, range: KeyRange) -> Result<ScanIterator> {
        let start_off = match &range.0 {
            Bound::Included(key) | Bound::Excluded(key) => self.index.scan_start(key),
            Bound::Unbounded => 0,
        };

        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(start_off))?;

        let inner = TableIterator {
            reader,
            pos: start_off,
            data_end: self.footer.index_off,
            done: false,
        };
        Ok(RangeFilter::new(inner, range))
    }
}

fn read_block(file: &mut File, offset: u64, len: u32) -> Result<Vec<u8>> {
    let mut block = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut block)?;
    Ok(block)
}

/// Sequential record reader over the data section.
pub struct TableIterator {
    reader: BufReader<File>,
    pos: u64,
    data_end: u64,
    done: bool,
}

impl Iterator for TableIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data_end {
            return None;
        }

        match Record::read_table(&mut self.reader) {
            Ok(Some(record)) => {
                match self.reader.stream_position() {
                    Ok(pos) => self.pos = pos,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                }
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub type ScanIterator = RangeFilter<TableIterator>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::to_key_range;
    use crate::sstable::TableBuilder;
    use crate::tmpfs::TempDir;

    fn build_table(dir: &TempDir, records: &[Record]) -> Table {
        let path = dir.path().join("00000001.sst");
        let mut builder =
            TableBuilder::create(&path, records.len(), 0.01, 4).expect("create failed");
        for record in records {
            builder.add(record).expect("add failed");
        }
        builder.finish().expect("finish failed");
        Table::open(&path).expect("open failed")
    }

    fn sample_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Record::put(
                    format!("key_{:04}", i).into_bytes(),
                    format!("value_{:04}", i).into_bytes(),
                    i as u64,
                )
            })
            .collect()
    }

    #[test]
    fn test_point_lookup_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let records = sample_records(100);
        let table = build_table(&dir, &records);

        for record in &records {
            let found = table
                .get(&record.key)
                .expect("get failed")
                .expect("key missing");
            assert_eq!(&found, record);
        }
    }

    #[test]
    fn test_lookup_misses() {
        let dir = TempDir::new().expect("temp dir");
        let table = build_table(&dir, &sample_records(100));

        // Before, between, and after the stored keys.
        assert!(table.get(b"key_").unwrap().is_none());
        assert!(table.get(b"key_0050x").unwrap().is_none());
        assert!(table.get(b"key_9999").unwrap().is_none());
    }

    #[test]
    fn test_tombstone_is_a_hit() {
        let dir = TempDir::new().expect("temp dir");
        let records = vec![
            Record::put(b"alive".to_vec(), b"v".to_vec(), 1),
            Record::tombstone(b"dead_".to_vec(), 2),
        ];
        let table = build_table(&dir, &records);

        let hit = table.get(b"dead_").unwrap().expect("tombstone missing");
        assert!(hit.is_tombstone());
        assert_eq!(hit.seq, 2);
    }

    #[test]
    fn test_scan_full_and_partial() {
        let dir = TempDir::new().expect("temp dir");
        let records = sample_records(100);
        let table = build_table(&dir, &records);

        let all: Vec<_> = table
            .scan(to_key_range::<std::ops::RangeFull>(..))
            .expect("scan failed")
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(all, records);

        let slice: Vec<_> = table
            .scan(to_key_range(
                b"key_0010".to_vec()..b"key_0015".to_vec(),
            ))
            .expect("scan failed")
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(slice, records[10..15].to_vec());
    }

    #[test]
    fn test_scan_is_ordered() {
        let dir = TempDir::new().expect("temp dir");
        let table = build_table(&dir, &sample_records(250));

        let mut last: Option<Vec<u8>> = None;
        for entry in table.scan(to_key_range::<std::ops::RangeFull>(..)).unwrap() {
            let record = entry.unwrap();
            if let Some(last) = &last {
                assert!(record.key > *last, "scan output out of order");
            }
            last = Some(record.key);
        }
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("1.sst");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(Table::open(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_open_rejects_garbage_footer() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("1.sst");
        std::fs::write(&path, vec![0xABu8; 4096]).unwrap();
        assert!(matches!(Table::open(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_seq_bounds_in_meta() {
        let dir = TempDir::new().expect("temp dir");
        let records = vec![
            Record::put(b"a".to_vec(), b"v".to_vec(), 17),
            Record::put(b"b".to_vec(), b"v".to_vec(), 4),
            Record::put(b"c".to_vec(), b"v".to_vec(), 99),
        ];
        let table = build_table(&dir, &records);

        assert_eq!(table.meta().seq_min, 4);
        assert_eq!(table.meta().seq_max, 99);
        assert_eq!(table.meta().min_key, b"a");
        assert_eq!(table.meta().max_key, b"c");
    }
}
