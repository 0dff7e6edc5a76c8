//! Advisory file lock guarding the data directory.
//!
//! Single-writer semantics are per engine instance; two processes (or
//! two engines in one process) opening the same directory is undefined
//! behavior for the data, so it is refused up front. The lock file
//! holds the owning process id for debugging. The OS releases the lock
//! when the file handle closes, crash included.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file and acquires an exclusive, non-blocking
    /// lock on it. Fails immediately if another holder exists.
    pub fn acquire<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        if unsafe { flock(fd, LOCK_EX | LOCK_NB) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; allow the open so the
        // engine still runs, without multi-process protection.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
