//! Write-Ahead Log: the durable record of writes applied to the live
//! memtable, replayed at startup to rebuild it.
//!
//! # File Format
//!
//! A WAL file is a bare sequence of frames with no header:
//!
//! ```text
//! +-----------+---------------+------------------+
//! |crc32: u32 |payload_len:u32| payload          |
//! +-----------+---------------+------------------+
//! | 4 bytes   | 4 bytes       | payload_len bytes|
//! +-----------+---------------+------------------+
//! ```
//!
//! All integers are little-endian. The CRC32 covers the payload only;
//! the payload is the WAL encoding of a record (see `record`).
//!
//! # Recovery
//!
//! Replay reads frames sequentially, validating length and checksum.
//! The first frame that fails validation ends the replay: everything
//! after the last good frame is assumed to be a torn write from a crash
//! and is truncated away. Complete frames before the tear are always
//! recovered.
//!
//! # Lifecycle
//!
//! One WAL exists per live memtable. The active file is `wal.log`; when
//! the engine rotates a memtable the file is renamed to `wal.log.<id>`
//! and deleted once the flush of its memtable has committed.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::codec::CRC32;
use crate::error::{Error, Result};
use crate::record::Record;

/// Frames larger than this are rejected during replay as corruption
/// rather than allocated.
const MAX_FRAME_LEN: u32 = 512 * 1024 * 1024;

pub struct Wal {
    file: File,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    sync_on_write: bool,
    /// Logical size: file bytes plus frames still in the write buffer.
    appended: AtomicU64,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish()
    }
}

impl Wal {
    /// Opens (or creates) a WAL at the given path, positioned for
    /// appending.
    pub fn open(path: impl Into<PathBuf>, sync_on_write: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);
        let appended = AtomicU64::new(file.metadata()?.len());

        Ok(Self {
            file,
            writer: Mutex::new(writer),
            path,
            sync_on_write,
            appended,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical size in bytes (buffered frames included), for stats
    /// reporting and truncation checks.
    pub fn size(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Appends one record as a framed entry. When sync-on-write is
    /// configured the frame is durable before this returns; a failure
    /// here must not acknowledge the write.
    pub fn append(&self, record: &Record) -> Result<()> {
        let payload = record.encode_wal();
        let checksum = CRC32.checksum(&payload);

        let mut writer = self.writer.lock()?;
        writer.write_u32::<LittleEndian>(checksum)?;
        writer.write_u32::<LittleEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        self.appended
            .fetch_add(8 + payload.len() as u64, Ordering::Relaxed);

        if self.sync_on_write {
            writer.flush()?;
            self.file.sync_data()?;
        }

        Ok(())
    }

    /// Flushes buffered frames and syncs them to disk.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays all complete frames and repairs the file by truncating
    /// any torn tail. Returns the recovered records in append order.
    pub fn replay(&self) -> Result<Vec<Record>> {
        self.writer.lock()?.flush()?;

        let mut iter = ReplayIterator::new(&self.path)?;
        let mut records = Vec::new();
        for entry in iter.by_ref() {
            records.push(entry?);
        }

        let file_len = self.file.metadata()?.len();
        if iter.valid_len < file_len {
            tracing::warn!(
                path = %self.path.display(),
                valid_len = iter.valid_len,
                file_len = file_len,
                "truncating torn WAL tail"
            );
            self.file.set_len(iter.valid_len)?;
            self.file.sync_data()?;
            self.appended.store(iter.valid_len, Ordering::Relaxed);
        }

        Ok(records)
    }

    /// Renames the file, keeping the open handles valid. Used when the
    /// active `wal.log` becomes a frozen `wal.log.<id>`.
    pub fn rename(&mut self, to: impl Into<PathBuf>) -> Result<()> {
        let to = to.into();
        std::fs::rename(&self.path, &to)?;
        self.path = to;
        Ok(())
    }

    /// Deletes the file after its memtable has been flushed.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        Ok(std::fs::remove_file(path)?)
    }
}

/// Streams complete frames out of a WAL file, stopping at the first
/// invalid one. `valid_len` tracks the offset past the last good frame.
struct ReplayIterator {
    reader: BufReader<File>,
    valid_len: u64,
    done: bool,
}

impl ReplayIterator {
    fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            valid_len: 0,
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<(Record, u64)>> {
        let checksum = match self.reader.read_u32::<LittleEndian>() {
            Ok(crc) => crc,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let payload_len = self.reader.read_u32::<LittleEndian>()?;
        if payload_len > MAX_FRAME_LEN {
            return Err(Error::Corruption(format!(
                "frame length {} exceeds maximum",
                payload_len
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        self.reader.read_exact(&mut payload)?;

        if CRC32.checksum(&payload) != checksum {
            return Err(Error::Corruption("frame checksum mismatch".to_string()));
        }

        let record = Record::decode_wal(&payload)?;
        Ok(Some((record, 8 + u64::from(payload_len))))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some((record, frame_len))) => {
                self.valid_len += frame_len;
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(_) => {
                // Incomplete or corrupt tail: stop replay at the last
                // good frame. The caller truncates.
                self.done = true;
                None
            }
        }
    }
}

/// Seeks to `offset` and overwrites bytes in place. Test-only hook for
/// simulating torn writes.
#[cfg(test)]
pub fn corrupt_at(path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    use std::io::{Seek, SeekFrom};

    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn wal_records() -> Vec<Record> {
        vec![
            Record::put(b"key1".to_vec(), b"value1".to_vec(), 1),
            Record::put(b"key2".to_vec(), b"value2".to_vec(), 2),
            Record::tombstone(b"key1".to_vec(), 3),
        ]
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().expect("temp dir");
        let wal = Wal::open(dir.path().join("wal.log"), false).expect("open failed");

        for record in wal_records() {
            wal.append(&record).expect("append failed");
        }
        wal.sync().expect("sync failed");

        let replayed = wal.replay().expect("replay failed");
        assert_eq!(replayed, wal_records());
    }

    #[test]
    fn test_empty_replay() {
        let dir = TempDir::new().expect("temp dir");
        let wal = Wal::open(dir.path().join("wal.log"), false).expect("open failed");
        assert!(wal.replay().expect("replay failed").is_empty());
    }

    #[test]
    fn test_sync_on_write() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("wal.log");

        {
            let wal = Wal::open(&path, true).expect("open failed");
            wal.append(&Record::put(b"k".to_vec(), b"v".to_vec(), 1))
                .expect("append failed");
            // No explicit sync: the frame must already be on disk.
        }

        let wal = Wal::open(&path, true).expect("reopen failed");
        let replayed = wal.replay().expect("replay failed");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].key, b"k");
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("wal.log");

        let wal = Wal::open(&path, false).expect("open failed");
        for record in wal_records() {
            wal.append(&record).expect("append failed");
        }
        wal.sync().expect("sync failed");
        let intact_len = wal.size();
        drop(wal);

        // Simulate a torn write: half of a frame appended after the
        // last complete one.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();
        file.sync_data().unwrap();

        let wal = Wal::open(&path, false).expect("reopen failed");
        let replayed = wal.replay().expect("replay failed");
        assert_eq!(replayed, wal_records());
        assert_eq!(wal.size(), intact_len, "tail was not truncated");
    }

    #[test]
    fn test_corrupt_middle_frame_stops_replay() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("wal.log");

        let wal = Wal::open(&path, false).expect("open failed");
        for record in wal_records() {
            wal.append(&record).expect("append failed");
        }
        wal.sync().expect("sync failed");
        drop(wal);

        // Flip payload bytes of the second frame. Frame one is
        // 8 + payload bytes long; aim safely inside frame two.
        let first_frame_len =
            8 + Record::put(b"key1".to_vec(), b"value1".to_vec(), 1)
                .encode_wal()
                .len() as u64;
        corrupt_at(&path, first_frame_len + 10, b"garbage").unwrap();

        let wal = Wal::open(&path, false).expect("reopen failed");
        let replayed = wal.replay().expect("replay failed");

        // Only the first frame survives; the rest is truncated.
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].key, b"key1");
        assert_eq!(wal.size(), first_frame_len);
    }

    #[test]
    fn test_rename_keeps_appending() {
        let dir = TempDir::new().expect("temp dir");
        let mut wal = Wal::open(dir.path().join("wal.log"), false).expect("open failed");

        wal.append(&Record::put(b"a".to_vec(), b"1".to_vec(), 1))
            .expect("append failed");
        wal.rename(dir.path().join("wal.log.0")).expect("rename failed");
        wal.append(&Record::put(b"b".to_vec(), b"2".to_vec(), 2))
            .expect("append after rename failed");
        wal.sync().expect("sync failed");

        assert_eq!(wal.path(), dir.path().join("wal.log.0"));
        let replayed = wal.replay().expect("replay failed");
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn test_remove_deletes_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("wal.log");
        let wal = Wal::open(&path, false).expect("open failed");
        wal.append(&Record::put(b"k".to_vec(), b"v".to_vec(), 1))
            .expect("append failed");
        wal.sync().expect("sync failed");

        wal.remove().expect("remove failed");
        assert!(!path.exists());
    }
}
