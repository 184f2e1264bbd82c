//! # htdb Storage
//!
//! I/O backend and byte-range locks for htdb.
//!
//! Storage backends are **opaque byte stores** of a fixed, explicitly
//! managed size. They know nothing of the htdb file format.
//!
//! ## Design Principles
//!
//! - Positioned reads and writes; the size only changes through `grow` and `truncate`
//! - Memory mapped when the platform allows it, with a silent fallback to
//!   `pread`/`pwrite`
//! - Growth tries a sparse extension first and forces allocation of a
//!   trailing byte when the filesystem refuses
//! - Advisory byte-range locks with process-wide semantics, one
//!   implementation per platform selected at build time
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For volatile databases and tests
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use htdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.grow(11).unwrap();
//! backend.write_at(0, b"hello world").unwrap();
//! let data = backend.read_at(6, 5).unwrap();
//! assert_eq!(&data, b"world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod lock;
mod memory;
mod mmap;

pub use backend::{FileIdentity, LockKind, LockWait, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, FileOptions};
pub use memory::InMemoryBackend;
