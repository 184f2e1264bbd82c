//! POSIX `fcntl` record locks.
#![allow(unsafe_code)]

use super::{would_block, RangeLocker};
use crate::backend::{LockKind, LockWait};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Byte-range locks via `F_SETLK` / `F_SETLKW`.
#[derive(Debug, Default)]
pub(crate) struct FcntlLocker;

impl FcntlLocker {
    pub(crate) fn new(_path: &Path) -> io::Result<Self> {
        Ok(Self)
    }
}

fn to_off(value: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "lock offset out of range"))
}

fn set_lock(
    file: &File,
    offset: u64,
    len: u64,
    l_type: libc::c_int,
    wait: LockWait,
) -> io::Result<()> {
    // SAFETY: `flock` is a plain C struct for which all-zero is valid.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = to_off(offset)?;
    fl.l_len = to_off(len)?;

    let cmd = match wait {
        LockWait::Wait => libc::F_SETLKW,
        LockWait::NoWait => libc::F_SETLK,
    };

    loop {
        // SAFETY: the descriptor is owned by `file`, which outlives the call,
        // and `fl` is a valid flock for the duration of the call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl as *const libc::flock) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code)
                if wait == LockWait::NoWait && (code == libc::EAGAIN || code == libc::EACCES) =>
            {
                return Err(would_block());
            }
            _ => return Err(err),
        }
    }
}

impl RangeLocker for FcntlLocker {
    fn lock(
        &self,
        file: &File,
        offset: u64,
        len: u64,
        kind: LockKind,
        wait: LockWait,
    ) -> io::Result<()> {
        let l_type = match kind {
            LockKind::Read => libc::F_RDLCK,
            LockKind::Write => libc::F_WRLCK,
        };
        set_lock(file, offset, len, l_type as libc::c_int, wait)
    }

    fn unlock(&self, file: &File, offset: u64, len: u64) -> io::Result<()> {
        set_lock(file, offset, len, libc::F_UNLCK as libc::c_int, LockWait::NoWait)
    }
}
