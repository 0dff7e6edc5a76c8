//! Table builder: streams sorted records to a temporary file and
//! publishes the finished table with an atomic rename.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::record::Record;

use super::index::SparseIndex;
use super::meta::TableMeta;
use super::{Footer, TMP_SUFFIX};

pub struct TableBuilder {
    writer: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    index: SparseIndex,
    bloom: BloomFilter,
    index_interval: usize,
    offset: u64,
    meta: TableMeta,
    last_key: Option<Vec<u8>>,
}

impl TableBuilder {
    /// Starts a table at `<path>.tmp`. `expected_items` sizes the bloom
    /// filter; overshooting only costs accuracy, never correctness.
    pub fn create(
        path: impl Into<PathBuf>,
        expected_items: usize,
        fp_rate: f64,
        index_interval: usize,
    ) -> Result<Self> {
        let final_path = path.into();
        let tmp_path = final_path.with_extension(format!("sst.{}", TMP_SUFFIX));

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .map_err(Error::from_write_io)?;

        let bloom = BloomFilter::new(expected_items, fp_rate);
        let meta = TableMeta {
            bloom_nbits: bloom.nbits(),
            bloom_nhashes: bloom.nhashes(),
            ..Default::default()
        };

        Ok(Self {
            writer: BufWriter::new(file),
            tmp_path,
            final_path,
            index: SparseIndex::new(),
            bloom,
            index_interval: index_interval.max(1),
            offset: 0,
            meta,
            last_key: None,
        })
    }

    /// Appends one record. Records must arrive in strictly increasing
    /// key order with at most one version per key.
    pub fn add(&mut self, record: &Record) -> Result<()> {
        if let Some(last) = &self.last_key {
            if record.key.as_slice() <= last.as_slice() {
                return Err(Error::InvalidInput(
                    "table records must be added in strictly increasing key order".to_string(),
                ));
            }
        }

        if self.meta.key_count % self.index_interval as u64 == 0 {
            self.index.push(record.key.clone(), self.offset);
        }
        self.bloom.add(&record.key);

        let mut buf = Vec::with_capacity(record.payload_bytes() + 32);
        let len = record.encode_table(&mut buf);
        self.writer.write_all(&buf).map_err(Error::from_write_io)?;
        self.offset += len as u64;

        if self.meta.key_count == 0 {
            self.meta.min_key = record.key.clone();
            self.meta.seq_min = record.seq;
            self.meta.seq_max = record.seq;
        } else {
            self.meta.seq_min = self.meta.seq_min.min(record.seq);
            self.meta.seq_max = self.meta.seq_max.max(record.seq);
        }
        self.meta.max_key = record.key.clone();
        self.meta.key_count += 1;
        self.last_key = Some(record.key.clone());

        Ok(())
    }

    pub fn key_count(&self) -> u64 {
        self.meta.key_count
    }

    /// Bytes written to the data section so far; used by compaction to
    /// rotate output files at a key boundary.
    pub fn data_bytes(&self) -> u64 {
        self.offset
    }

    /// Writes the trailer blocks and footer, syncs, and atomically
    /// renames the table into place. Returns the metadata and the final
    /// file size.
    pub fn finish(mut self) -> Result<(TableMeta, u64)> {
        if self.meta.key_count == 0 {
            return Err(Error::InvalidInput(
                "refusing to publish an empty table".to_string(),
            ));
        }

        let index_block = self.index.encode();
        let bloom_block = self.bloom.encode();
        let meta_block = self.meta.encode();

        let footer = Footer {
            index_off: self.offset,
            index_len: index_block.len() as u32,
            bloom_off: self.offset + index_block.len() as u64,
            bloom_len: bloom_block.len() as u32,
            meta_off: self.offset + index_block.len() as u64 + bloom_block.len() as u64,
            meta_len: meta_block.len() as u32,
        };

        self.writer
            .write_all(&index_block)
            .map_err(Error::from_write_io)?;
        self.writer
            .write_all(&bloom_block)
            .map_err(Error::from_write_io)?;
        self.writer
            .write_all(&meta_block)
            .map_err(Error::from_write_io)?;
        self.writer
            .write_all(&footer.encode())
            .map_err(Error::from_write_io)?;
        self.writer.flush().map_err(Error::from_write_io)?;

        let file = self.writer.into_inner().map_err(|e| Error::Io(e.to_string()))?;
        file.sync_all().map_err(Error::from_write_io)?;
        drop(file);

        std::fs::rename(&self.tmp_path, &self.final_path).map_err(Error::from_write_io)?;
        sync_dir(&self.final_path)?;

        let size = std::fs::metadata(&self.final_path)?.len();
        Ok((self.meta, size))
    }

    /// Drops the partial output, removing the temporary file. Used when
    /// a compaction is canceled mid-build.
    pub fn discard(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self.writer);
        if let Err(e) = std::fs::remove_file(&tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %tmp_path.display(), error = %e, "failed to remove partial table");
            }
        }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

/// Syncs the directory containing `path` so a rename survives a crash.
pub fn sync_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_builder_publishes_atomically() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("00000001.sst");

        let mut builder = TableBuilder::create(&path, 10, 0.01, 4).expect("create failed");
        for i in 0..10u64 {
            builder
                .add(&Record::put(
                    format!("key_{:02}", i).into_bytes(),
                    b"value".to_vec(),
                    i,
                ))
                .expect("add failed");
        }

        // Not published until finish.
        assert!(!path.exists());

        let (meta, size) = builder.finish().expect("finish failed");
        assert!(path.exists());
        assert!(size > 0);
        assert_eq!(meta.key_count, 10);
        assert_eq!(meta.min_key, b"key_00");
        assert_eq!(meta.max_key, b"key_09");
        assert_eq!(meta.seq_min, 0);
        assert_eq!(meta.seq_max, 9);

        // No temp file left behind.
        assert!(dir
            .path()
            .read_dir()
            .unwrap()
            .all(|e| e.unwrap().path().extension().unwrap() == "sst"));
    }

    #[test]
    fn test_builder_rejects_unsorted_keys() {
        let dir = TempDir::new().expect("temp dir");
        let mut builder =
            TableBuilder::create(dir.path().join("1.sst"), 10, 0.01, 4).expect("create failed");

        builder
            .add(&Record::put(b"b".to_vec(), b"v".to_vec(), 1))
            .expect("add failed");
        assert!(builder
            .add(&Record::put(b"a".to_vec(), b"v".to_vec(), 2))
            .is_err());
        assert!(builder
            .add(&Record::put(b"b".to_vec(), b"v".to_vec(), 3))
            .is_err());
    }

    #[test]
    fn test_builder_rejects_empty_table() {
        let dir = TempDir::new().expect("temp dir");
        let builder =
            TableBuilder::create(dir.path().join("1.sst"), 10, 0.01, 4).expect("create failed");
        assert!(builder.finish().is_err());
    }

    #[test]
    fn test_discard_removes_partial_output() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("1.sst");
        let mut builder = TableBuilder::create(&path, 10, 0.01, 4).expect("create failed");
        builder
            .add(&Record::put(b"a".to_vec(), b"v".to_vec(), 1))
            .expect("add failed");

        builder.discard();
        assert_eq!(dir.path().read_dir().unwrap().count(), 0);
    }
}
