//! Whole-file locking through a sidecar file, for platforms without
//! POSIX record locks.
//!
//! Every range maps onto one exclusive `fs2` lock on `<file>.lock`, held
//! while this process holds any range. Read locks are exclusive too.

use super::{would_block, RangeLocker};
use crate::backend::{LockKind, LockWait};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[derive(Debug)]
pub(crate) struct SidecarLocker {
    sidecar: File,
    holds: Mutex<usize>,
}

impl SidecarLocker {
    pub(crate) fn new(path: &Path) -> io::Result<Self> {
        let mut name = path.as_os_str().to_owned();
        name.push(".lock");
        let sidecar = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Path::new(&name))?;
        Ok(Self {
            sidecar,
            holds: Mutex::new(0),
        })
    }
}

impl RangeLocker for SidecarLocker {
    fn lock(
        &self,
        _file: &File,
        _offset: u64,
        _len: u64,
        _kind: LockKind,
        wait: LockWait,
    ) -> io::Result<()> {
        let mut holds = self.holds.lock();
        if *holds == 0 {
            match wait {
                LockWait::Wait => self.sidecar.lock_exclusive()?,
                LockWait::NoWait => self.sidecar.try_lock_exclusive().map_err(|err| {
                    if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                        would_block()
                    } else {
                        err
                    }
                })?,
            }
        }
        *holds += 1;
        Ok(())
    }

    fn unlock(&self, _file: &File, _offset: u64, _len: u64) -> io::Result<()> {
        let mut holds = self.holds.lock();
        if *holds == 0 {
            return Ok(());
        }
        *holds -= 1;
        if *holds == 0 {
            FileExt::unlock(&self.sidecar)?;
        }
        Ok(())
    }
}
