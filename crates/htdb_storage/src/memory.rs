//! In-memory storage backend for volatile databases.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// An in-memory storage backend.
///
/// This backend stores all data in memory and is suitable for:
/// - Volatile databases that never touch the filesystem
/// - Unit tests
///
/// Locks are always granted: no other process can see this storage.
///
/// # Example
///
/// ```rust
/// use htdb_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.grow(16).unwrap();
/// backend.write_at(4, b"test").unwrap();
/// assert_eq!(backend.read_at(4, 4).unwrap(), b"test");
/// assert_eq!(backend.size().unwrap(), 16);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

fn to_usize(value: u64, requested: u64) -> StorageResult<usize> {
    usize::try_from(value).map_err(|_| StorageError::OutOfSpace { requested })
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        let end = offset.saturating_add(bytes.len() as u64);

        if end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: bytes.len(),
                size,
            });
        }

        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn grow(&mut self, new_size: u64) -> StorageResult<()> {
        let new_len = to_usize(new_size, new_size)?;
        let mut data = self.data.write();
        let cur_len = data.len();
        if new_len > cur_len {
            data.try_reserve(new_len - cur_len)
                .map_err(|_| StorageError::OutOfSpace {
                    requested: new_size,
                })?;
            data.resize(new_len, 0);
        }
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let new_len = to_usize(new_size, new_size)?;
        let mut data = self.data.write();
        data.resize(new_len, 0);
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        // Nothing to make durable
        Ok(())
    }
}
