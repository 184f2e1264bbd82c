//! File-based storage backend for persistent storage.

use crate::backend::{FileIdentity, LockKind, LockWait, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::lock::{PlatformLocker, RangeLocker};
use crate::mmap::FileMap;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Options for opening a [`FileBackend`].
#[derive(Debug, Clone)]
pub struct FileOptions {
    /// Open without write access. Writes, growth and write locks fail.
    pub read_only: bool,

    /// Create the file if it does not exist.
    pub create: bool,

    /// Fail if the file already exists.
    pub create_new: bool,

    /// Access the file through a shared memory map when possible.
    pub use_mmap: bool,

    /// Unix permission bits for newly created files.
    pub mode: u32,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            create: true,
            create_new: false,
            use_mmap: true,
            mode: 0o600,
        }
    }
}

impl FileOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets read-only access.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets whether a missing file is created.
    #[must_use]
    pub const fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets whether an existing file is an error.
    #[must_use]
    pub const fn create_new(mut self, value: bool) -> Self {
        self.create_new = value;
        self
    }

    /// Sets whether to use a memory map.
    #[must_use]
    pub const fn use_mmap(mut self, value: bool) -> Self {
        self.use_mmap = value;
        self
    }

    /// Sets the permission bits for new files.
    #[must_use]
    pub const fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug)]
struct FileState {
    size: u64,
    map: Option<FileMap>,
}

/// A file-based storage backend.
///
/// Reads and writes go through a shared memory map of the whole file when
/// one can be established; otherwise, or when disabled, through positioned
/// `pread`/`pwrite`. The fallback is silent and invisible to callers.
///
/// The backend re-reads the file length whenever an access falls beyond
/// the length it last saw, because other processes grow the same file.
///
/// # Durability
///
/// `sync()` flushes the map and calls `File::sync_all()`.
///
/// # Example
///
/// ```no_run
/// use htdb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("data.htdb")).unwrap();
/// backend.grow(4096).unwrap();
/// backend.write_at(0, b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
    read_only: bool,
    use_mmap: bool,
    state: RwLock<FileState>,
    locker: PlatformLocker,
}

impl FileBackend {
    /// Opens or creates a read-write file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with(path, &FileOptions::default())
    }

    /// Opens a file backend with explicit options.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open_with(path: &Path, options: &FileOptions) -> StorageResult<Self> {
        let mut open = OpenOptions::new();
        open.read(true).write(!options.read_only);
        if !options.read_only {
            open.create(options.create).create_new(options.create_new);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(options.mode);
        }
        let file = open.open(path)?;
        let locker = PlatformLocker::new(path)?;

        let mut state = FileState { size: 0, map: None };
        refresh(&file, &mut state, options.use_mmap, !options.read_only)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            read_only: options.read_only,
            use_mmap: options.use_mmap,
            state: RwLock::new(state),
            locker,
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh(&mut self) -> StorageResult<()> {
        let writable = !self.read_only;
        refresh(&self.file, self.state.get_mut(), self.use_mmap, writable)
    }

    /// Forces allocation of the byte at `new_size - 1`, retrying once on a
    /// short write.
    fn write_trailing_byte(&self, new_size: u64) -> StorageResult<()> {
        let offset = new_size - 1;
        for _ in 0..2 {
            match pio::write_at(&self.file, &[0], offset) {
                Ok(1) => return Ok(()),
                Ok(_) => continue,
                Err(err) if is_out_of_space(&err) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StorageError::OutOfSpace {
            requested: new_size,
        })
    }
}

/// Re-reads the file length and remaps if it changed.
fn refresh(file: &File, state: &mut FileState, use_mmap: bool, writable: bool) -> StorageResult<()> {
    let size = file.metadata()?.len();
    let mapped_len = state.map.as_ref().map(|map| map.len() as u64);
    if mapped_len == Some(size) || (!use_mmap && state.size == size) {
        state.size = size;
        return Ok(());
    }

    state.map = None;
    if use_mmap && size > 0 {
        match FileMap::map(file, writable) {
            Ok(map) => state.map = Some(map),
            Err(err) => debug!(error = %err, size, "memory map unavailable, using positioned I/O"),
        }
    }
    state.size = size;
    Ok(())
}

fn check_range(offset: u64, len: usize, size: u64) -> bool {
    offset
        .checked_add(len as u64)
        .is_some_and(|end| end <= size)
}

fn read_mapped_or_positioned(
    file: &File,
    state: &FileState,
    offset: u64,
    len: usize,
) -> StorageResult<Vec<u8>> {
    if let Some(map) = &state.map {
        if check_range(offset, len, map.len() as u64) {
            let start = offset as usize;
            return Ok(map.bytes()[start..start + len].to_vec());
        }
    }
    let mut buffer = vec![0u8; len];
    pio::read_exact_at(file, &mut buffer, offset)?;
    Ok(buffer)
}

#[cfg(unix)]
fn is_out_of_space(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
}

#[cfg(not(unix))]
fn is_out_of_space(_err: &io::Error) -> bool {
    false
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        {
            let state = self.state.read();
            if check_range(offset, len, state.size) {
                return read_mapped_or_positioned(&self.file, &state, offset, len);
            }
        }

        let mut state = self.state.write();
        refresh(&self.file, &mut state, self.use_mmap, !self.read_only)?;
        if !check_range(offset, len, state.size) {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: state.size,
            });
        }
        read_mapped_or_positioned(&self.file, &state, offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if data.is_empty() {
            return Ok(());
        }
        if !check_range(offset, data.len(), self.state.get_mut().size) {
            self.refresh()?;
        }

        let state = self.state.get_mut();
        if !check_range(offset, data.len(), state.size) {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size: state.size,
            });
        }
        if let Some(map) = &mut state.map {
            if check_range(offset, data.len(), map.len() as u64) {
                map.write(offset as usize, data)?;
                return Ok(());
            }
        }
        pio::write_all_at(&self.file, data, offset)?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        // Other processes grow and truncate the file under their locks.
        let mut state = self.state.write();
        refresh(&self.file, &mut state, self.use_mmap, !self.read_only)?;
        Ok(state.size)
    }

    fn grow(&mut self, new_size: u64) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let current = self.file.metadata()?.len();
        if new_size > current {
            if let Err(err) = self.file.set_len(new_size) {
                debug!(error = %err, new_size, "direct extension refused, writing trailing byte");
                self.write_trailing_byte(new_size)?;
            }
        }
        self.refresh()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        // Drop the map first so no view outlives the bytes it covers.
        self.state.get_mut().map = None;
        self.file.set_len(new_size)?;
        self.refresh()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        if let Some(map) = &self.state.get_mut().map {
            map.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn lock(&self, offset: u64, len: u64, kind: LockKind, wait: LockWait) -> StorageResult<()> {
        self.locker
            .lock(&self.file, offset, len, kind, wait)
            .map_err(StorageError::from)
    }

    fn unlock(&self, offset: u64, len: u64) -> StorageResult<()> {
        self.locker
            .unlock(&self.file, offset, len)
            .map_err(StorageError::from)
    }

    fn is_mapped(&self) -> bool {
        self.state.read().map.is_some()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[cfg(unix)]
    fn identity(&self) -> Option<FileIdentity> {
        use std::os::unix::fs::MetadataExt;
        let meta = self.file.metadata().ok()?;
        Some(FileIdentity::Inode {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn identity(&self) -> Option<FileIdentity> {
        std::fs::canonicalize(&self.path)
            .ok()
            .map(FileIdentity::Path)
    }
}

/// Positioned I/O that never moves a shared file cursor.
mod pio {
    use std::fs::File;
    use std::io;

    #[cfg(unix)]
    pub(super) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
    }

    #[cfg(unix)]
    pub(super) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
    }

    #[cfg(unix)]
    pub(super) fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(file, buf, offset)
    }

    #[cfg(windows)]
    pub(super) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match file.seek_read(buf, offset)? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    let rest = std::mem::take(&mut buf);
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    pub(super) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match file.seek_write(buf, offset)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    pub(super) fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(file, buf, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_sized(path: &Path, size: u64, use_mmap: bool) -> FileBackend {
        let mut backend =
            FileBackend::open_with(path, &FileOptions::new().use_mmap(use_mmap)).unwrap();
        backend.grow(size).unwrap();
        backend
    }

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_write_and_read_mapped_and_unmapped() {
        for use_mmap in [true, false] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("test.htdb");

            let mut backend = open_sized(&path, 64, use_mmap);
            assert_eq!(backend.is_mapped(), use_mmap);

            backend.write_at(3, b"hello world").unwrap();
            assert_eq!(backend.read_at(3, 11).unwrap(), b"hello world");
            assert_eq!(backend.read_at(9, 5).unwrap(), b"world");
            assert_eq!(backend.read_at(0, 3).unwrap(), [0, 0, 0]);
        }
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        let backend = open_sized(&path, 16, true);
        let result = backend.read_at(10, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
        let result = backend.read_at(u64::MAX, 1);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_write_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        let mut backend = open_sized(&path, 16, false);
        let result = backend.write_at(12, b"too long");
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
        assert_eq!(backend.size().unwrap(), 16);
    }

    #[test]
    fn file_grow_preserves_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        let mut backend = open_sized(&path, 8, true);
        backend.write_at(0, b"abcdefgh").unwrap();
        backend.grow(1 << 20).unwrap();

        assert_eq!(backend.size().unwrap(), 1 << 20);
        assert_eq!(backend.read_at(0, 8).unwrap(), b"abcdefgh");
        assert_eq!(backend.read_at((1 << 20) - 4, 4).unwrap(), [0; 4]);
    }

    #[test]
    fn file_sees_growth_by_another_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        let backend = open_sized(&path, 8, true);
        {
            let other = OpenOptions::new().write(true).open(&path).unwrap();
            other.set_len(32).unwrap();
            pio::write_all_at(&other, b"late", 28).unwrap();
        }
        assert_eq!(backend.read_at(28, 4).unwrap(), b"late");
        assert_eq!(backend.size().unwrap(), 32);
    }

    #[test]
    fn file_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        let mut backend = open_sized(&path, 64, true);
        backend.write_at(0, b"keep").unwrap();
        backend.truncate(4).unwrap();
        assert_eq!(backend.size().unwrap(), 4);
        assert_eq!(backend.read_at(0, 4).unwrap(), b"keep");
        assert!(backend.read_at(4, 1).is_err());
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        {
            let mut backend = open_sized(&path, 15, true);
            backend.write_at(0, b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 15);
        assert_eq!(backend.read_at(0, 15).unwrap(), b"persistent data");
    }

    #[test]
    fn file_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");
        drop(open_sized(&path, 16, true));

        let mut backend =
            FileBackend::open_with(&path, &FileOptions::new().read_only(true)).unwrap();
        assert!(backend.is_read_only());
        assert!(matches!(
            backend.write_at(0, b"x"),
            Err(StorageError::ReadOnly)
        ));
        assert!(matches!(backend.grow(64), Err(StorageError::ReadOnly)));
        assert_eq!(backend.read_at(0, 16).unwrap(), [0; 16]);
    }

    #[test]
    fn file_create_new_rejects_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");
        drop(FileBackend::open(&path).unwrap());

        let result = FileBackend::open_with(&path, &FileOptions::new().create_new(true));
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[test]
    fn file_identity_matches_for_same_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        let a = FileBackend::open(&path).unwrap();
        let b = FileBackend::open(&path).unwrap();
        let other = FileBackend::open(&dir.path().join("other.htdb")).unwrap();
        assert!(a.identity().is_some());
        assert_eq!(a.identity(), b.identity());
        assert_eq!(FileIdentity::of_path(&path), a.identity());
        assert_eq!(FileIdentity::of_path(&dir.path().join("absent")), None);
        assert_ne!(a.identity(), other.identity());
    }

    #[test]
    fn file_lock_and_unlock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htdb");

        let backend = open_sized(&path, 16, true);
        backend.lock(0, 1, LockKind::Write, LockWait::Wait).unwrap();
        backend.lock(8, 0, LockKind::Read, LockWait::NoWait).unwrap();
        backend.unlock(8, 0).unwrap();
        backend.unlock(0, 1).unwrap();
    }
}
