//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to write beyond the end of storage without growing it first.
    #[error("write beyond end of storage: offset {offset}, len {len}, size {size}")]
    WritePastEnd {
        /// The requested write offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The file could not be grown to the requested size.
    #[error("out of space: cannot grow storage to {requested} bytes")]
    OutOfSpace {
        /// The size that was requested.
        requested: u64,
    },

    /// The storage was opened read-only.
    #[error("storage is read-only")]
    ReadOnly,
}

impl StorageError {
    /// Returns true if this is a failed non-blocking lock attempt.
    ///
    /// Lock contention surfaces as an `Io` error of kind `WouldBlock`
    /// so that callers can tell it apart from real failures.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::WouldBlock)
    }
}
