//! # htdb Core
//!
//! Single-file hash-table key/value engine.
//!
//! This crate provides:
//! - A file format of fixed header, hash chains and size-classed free lists
//! - Record operations: store, fetch, delete, append, traverse
//! - Multi-process coordination through advisory byte-range locks
//! - Transactions whose commit survives a crash at any point
//! - An integrity checker with a precisely defined detection surface
//!
//! ## Example
//!
//! ```rust
//! use htdb_core::{Config, Database, StoreMode};
//!
//! let mut db = Database::open_in_memory(&Config::new().hash_table_size_hint(17))?;
//! db.store(b"hello", b"world", StoreMode::Insert)?;
//! assert_eq!(db.fetch(b"hello")?, b"world");
//! db.check()?;
//! # Ok::<(), htdb_core::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod chain;
mod check;
mod config;
mod database;
mod error;
mod freelist;
mod hash;
mod io;
mod layout;
mod lock;
mod log;
mod stats;
mod store;
mod summary;
mod transaction;
mod traverse;

pub use config::Config;
pub use database::Database;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use hash::{HashFamily, HashFunction, HASH_CHECK_VECTOR};
pub use layout::{
    bucket_offset, data_start, free_root_offset, size_class, BLOCK_HEADER_SIZE,
    DEFAULT_HASH_SIZE, FORMAT_VERSION, FREE_CLASSES, FREE_VERIFIABLE_BYTES, HEADER_SIZE,
    HEADER_VERIFIABLE_BYTES, MIN_BLOCK_SIZE, TAILER_SIZE,
};
pub use log::{LogLevel, LogSink, TracingSink};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use store::StoreMode;
pub use summary::Summary;

/// Alias of [`CoreError`].
pub type Error = CoreError;

/// Alias of [`CoreResult`].
pub type Result<T> = CoreResult<T>;
