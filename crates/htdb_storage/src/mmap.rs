//! Shared memory map over the database file.
//!
//! Only construction is unsafe; once mapped, reads and writes go through
//! the safe slice API of `memmap2`.
#![allow(unsafe_code)]

use memmap2::{Mmap, MmapMut};
use std::fs::File;
use std::io;

/// A shared mapping of the whole file, writable when the file is.
#[derive(Debug)]
pub(crate) enum FileMap {
    Read(Mmap),
    Write(MmapMut),
}

impl FileMap {
    /// Maps the current length of `file`.
    pub(crate) fn map(file: &File, writable: bool) -> io::Result<Self> {
        // SAFETY: the mapping is MAP_SHARED, so bytes written by other
        // processes through their own maps or pwrite stay coherent with ours.
        // Every process only touches the file under the advisory locks, and
        // the backend remaps whenever the file length changes, so no access
        // is made past the end of the file.
        if writable {
            Ok(Self::Write(unsafe { MmapMut::map_mut(file)? }))
        } else {
            Ok(Self::Read(unsafe { Mmap::map(file)? }))
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes().len()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Self::Read(map) => map,
            Self::Write(map) => map,
        }
    }

    /// Copies `data` into the map at `offset`. The range must be in bounds.
    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Read(_) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "mapping is read-only",
            )),
            Self::Write(map) => {
                map[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
        }
    }

    pub(crate) fn flush(&self) -> io::Result<()> {
        match self {
            Self::Read(_) => Ok(()),
            Self::Write(map) => map.flush(),
        }
    }
}
