//! # htdb Testkit
//!
//! Test utilities for htdb.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - A log sink that captures every message
//! - A backend that fails every write after a budget, for crash testing
//! - Property-based test generators using proptest
//! - A handle on the `htdb-agent` binary, a second process driving the
//!   same file for multi-process tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use htdb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_database() {
//!     with_temp_db(|db| {
//!         db.store(b"key", b"value", StoreMode::Insert).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod sink;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agent::*;
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::sink::*;
    pub use htdb_core::{Config, Database, ErrorKind, StoreMode};
}

pub use agent::*;
pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use sink::*;
