use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid user input: oversized keys or values, malformed arguments.
    InvalidInput(String),
    /// A disk read, write, sync, or rename failed.
    Io(String),
    /// On-disk data failed validation: checksum mismatches, bad magic
    /// numbers, truncated or inconsistent blocks.
    Corruption(String),
    /// A write was attempted on a read-only structure (frozen memtable,
    /// published table) or on an engine degraded by a WAL failure.
    ReadOnly,
    /// A background operation was interrupted by shutdown.
    Canceled,
    /// The disk filled up during a flush or compaction.
    Full(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Canceled => write!(f, "operation canceled"),
            Error::Full(msg) => write!(f, "disk full: {msg}"),
        }
    }
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Classifies an I/O error from the flush or compaction path, where
    /// running out of disk space is handled differently from other
    /// failures.
    pub(crate) fn from_write_io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            Error::Full(err.to_string())
        } else {
            Error::Io(err.to_string())
        }
    }
}
