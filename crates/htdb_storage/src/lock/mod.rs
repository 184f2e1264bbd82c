//! Platform byte-range locking.
//!
//! Each platform gets exactly one [`RangeLocker`] implementation, chosen at
//! build time through the [`PlatformLocker`] alias.

use crate::backend::{LockKind, LockWait};
use std::fmt;
use std::fs::File;
use std::io;

#[cfg(unix)]
mod fcntl;
#[cfg(not(unix))]
mod sidecar;

#[cfg(unix)]
pub(crate) use fcntl::FcntlLocker as PlatformLocker;
#[cfg(not(unix))]
pub(crate) use sidecar::SidecarLocker as PlatformLocker;

/// Advisory locks over byte ranges of an open file.
///
/// Locks are owned by the process, not the handle: the OS does not stop a
/// process from conflicting with itself, so callers track what they hold.
pub(crate) trait RangeLocker: Send + Sync + fmt::Debug {
    /// Locks `len` bytes at `offset`; `len == 0` means "to end of file".
    ///
    /// Contention under [`LockWait::NoWait`] returns an error of kind
    /// [`io::ErrorKind::WouldBlock`].
    fn lock(
        &self,
        file: &File,
        offset: u64,
        len: u64,
        kind: LockKind,
        wait: LockWait,
    ) -> io::Result<()>;

    /// Releases `len` bytes at `offset`.
    fn unlock(&self, file: &File, offset: u64, len: u64) -> io::Result<()>;
}

pub(crate) fn would_block() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "lock is held by another process")
}
