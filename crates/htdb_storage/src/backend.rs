//! Storage backend trait definition.

use crate::error::StorageResult;

/// Kind of an advisory byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKind {
    /// Shared lock; any number of holders.
    Read,
    /// Exclusive lock.
    Write,
}

/// Whether a lock request may block the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Block until the lock is granted.
    Wait,
    /// Fail immediately with a would-block error on contention.
    NoWait,
}

/// Identity of an open file, used to detect a second open of the same
/// file within one process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileIdentity {
    /// Device and inode numbers.
    Inode {
        /// Device number.
        dev: u64,
        /// Inode number.
        ino: u64,
    },
    /// Canonical path, for platforms without inode numbers.
    Path(std::path::PathBuf),
}

impl FileIdentity {
    /// Returns the identity of the file at `path`, or `None` if it does
    /// not exist.
    ///
    /// Lets a caller recognize a file it already has open before opening
    /// another descriptor on it: closing any descriptor drops every
    /// `fcntl` lock the process holds on the file.
    #[must_use]
    pub fn of_path(path: &std::path::Path) -> Option<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::metadata(path).ok()?;
            Some(Self::Inode {
                dev: meta.dev(),
                ino: meta.ino(),
            })
        }
        #[cfg(not(unix))]
        {
            std::fs::canonicalize(path).ok().map(Self::Path)
        }
    }
}

/// A low-level storage backend for htdb.
///
/// Storage backends are **opaque byte stores** with a fixed size that only
/// changes through [`grow`](Self::grow) and [`truncate`](Self::truncate).
/// The database engine owns all file format interpretation.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` never extends the storage; callers grow first
/// - `grow` never changes existing content, even when it fails
/// - Backends must be `Send + Sync`
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For volatile databases and tests
/// - [`super::FileBackend`] - For persistent storage, memory mapped when possible
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// If the read extends past the size this backend last observed, the
    /// size is refreshed first, since another process may have grown the
    /// file.
    ///
    /// # Errors
    ///
    /// Returns `ReadPastEnd` if the range lies beyond the current size, or
    /// an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `WritePastEnd` if the range lies beyond the current size,
    /// `ReadOnly` for read-only storage, or an I/O error.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Grows the storage to at least `new_size` bytes.
    ///
    /// Does nothing if the storage is already that large. New bytes read as
    /// zero.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` if the filesystem refuses the growth.
    fn grow(&mut self, new_size: u64) -> StorageResult<()>;

    /// Truncates the storage to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Acquires an advisory lock on `len` bytes at `offset`.
    ///
    /// A `len` of zero extends the range to the end of the file and beyond.
    /// The default implementation grants every lock, which is right for
    /// storage no other process can see.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error of kind `WouldBlock` for contention under
    /// [`LockWait::NoWait`] (see [`StorageError::is_would_block`]), or any
    /// other I/O error from the OS.
    ///
    /// [`StorageError::is_would_block`]: crate::StorageError::is_would_block
    fn lock(&self, offset: u64, len: u64, kind: LockKind, wait: LockWait) -> StorageResult<()> {
        let _ = (offset, len, kind, wait);
        Ok(())
    }

    /// Releases an advisory lock taken with [`lock`](Self::lock).
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the OS.
    fn unlock(&self, offset: u64, len: u64) -> StorageResult<()> {
        let _ = (offset, len);
        Ok(())
    }

    /// Returns true when reads and writes go through a memory map.
    fn is_mapped(&self) -> bool {
        false
    }

    /// Returns true if the storage rejects writes.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Returns the identity of the underlying file, if there is one.
    fn identity(&self) -> Option<FileIdentity> {
        None
    }
}
