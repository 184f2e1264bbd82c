//! Crash testing for htdb.
//!
//! [`CrashableBackend`] keeps the file image in memory and fails every
//! mutating call (write, grow, truncate, sync) once a budget of them is
//! spent. Whatever was written before the failure stays in the image,
//! which is what a power cut at that point would leave on disk.
//!
//! ## Usage
//!
//! ```rust
//! use htdb_core::{Config, Database, StoreMode};
//! use htdb_testkit::CrashableBackend;
//!
//! let backend = CrashableBackend::new(Vec::new());
//! let disk = backend.disk();
//! let mut db = Database::open_with_backend(Box::new(backend), &Config::default()).unwrap();
//! db.store(b"k", b"v", StoreMode::Insert).unwrap();
//! drop(db);
//!
//! let mut db = disk.reopen(&Config::default()).unwrap();
//! assert_eq!(db.fetch(b"k").unwrap(), b"v");
//! ```

use htdb_core::{Config, Database};
use htdb_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Disk {
    image: Mutex<Vec<u8>>,
    budget: AtomicU64,
    spent: AtomicU64,
    crashed: AtomicBool,
}

/// Shared view of a [`CrashableBackend`]'s image; outlives the handle.
#[derive(Debug, Clone)]
pub struct CrashDisk(Arc<Disk>);

impl CrashDisk {
    /// Returns a copy of the current image.
    pub fn image(&self) -> Vec<u8> {
        self.0.image.lock().clone()
    }

    /// Returns true once a mutating call has been refused.
    pub fn has_crashed(&self) -> bool {
        self.0.crashed.load(Ordering::SeqCst)
    }

    /// Returns the number of mutating calls that went through.
    pub fn operations(&self) -> u64 {
        self.0.spent.load(Ordering::SeqCst)
    }

    /// Allows `budget` more mutating calls, then fails every one after.
    pub fn crash_after(&self, budget: u64) {
        self.0.spent.store(0, Ordering::SeqCst);
        self.0.budget.store(budget, Ordering::SeqCst);
        self.0.crashed.store(false, Ordering::SeqCst);
    }

    /// Opens the image as it stands, as the next process would after the
    /// crash.
    pub fn reopen(&self, config: &Config) -> htdb_core::Result<Database> {
        let backend = InMemoryBackend::with_data(self.image());
        Database::open_with_backend(Box::new(backend), config)
    }
}

/// A storage backend that can simulate a crash.
#[derive(Debug)]
pub struct CrashableBackend {
    disk: Arc<Disk>,
}

impl CrashableBackend {
    /// Creates a backend holding `image`, with no crash scheduled.
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            disk: Arc::new(Disk {
                image: Mutex::new(image),
                budget: AtomicU64::new(u64::MAX),
                spent: AtomicU64::new(0),
                crashed: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a backend that fails every mutating call after `budget`.
    pub fn crashing_after(image: Vec<u8>, budget: u64) -> Self {
        let backend = Self::new(image);
        backend.disk().crash_after(budget);
        backend
    }

    /// Returns a handle on the image that survives the backend.
    pub fn disk(&self) -> CrashDisk {
        CrashDisk(Arc::clone(&self.disk))
    }

    fn spend(&self, what: &str) -> StorageResult<()> {
        let spent = self.disk.spent.load(Ordering::SeqCst);
        if self.disk.crashed.load(Ordering::SeqCst)
            || spent >= self.disk.budget.load(Ordering::SeqCst)
        {
            self.disk.crashed.store(true, Ordering::SeqCst);
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated crash during {what}"),
            )));
        }
        self.disk.spent.store(spent + 1, Ordering::SeqCst);
        Ok(())
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let image = self.disk.image.lock();
        let size = image.len() as u64;
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => {
                let start = offset as usize;
                Ok(image[start..start + len].to_vec())
            }
            _ => Err(StorageError::ReadPastEnd { offset, len, size }),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.spend("write")?;
        let mut image = self.disk.image.lock();
        let size = image.len() as u64;
        match offset.checked_add(data.len() as u64) {
            Some(end) if end <= size => {
                let start = offset as usize;
                image[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            _ => Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            }),
        }
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.disk.image.lock().len() as u64)
    }

    fn grow(&mut self, new_size: u64) -> StorageResult<()> {
        if new_size <= self.size()? {
            return Ok(());
        }
        self.spend("grow")?;
        let len = usize::try_from(new_size)
            .map_err(|_| StorageError::OutOfSpace { requested: new_size })?;
        self.disk.image.lock().resize(len, 0);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.spend("truncate")?;
        let len = usize::try_from(new_size)
            .map_err(|_| StorageError::OutOfSpace { requested: new_size })?;
        self.disk.image.lock().truncate(len);
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.spend("sync")
    }
}
