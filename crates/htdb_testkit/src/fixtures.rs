//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use htdb_core::{Config, Database, StoreMode};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// Path of the file, if file-based.
    path: Option<PathBuf>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self::memory_with(&Config::default())
    }

    /// Creates an in-memory test database with `config`.
    pub fn memory_with(config: &Config) -> Self {
        Self {
            db: Database::open_in_memory(config).expect("Failed to open in-memory database"),
            path: None,
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test database.
    pub fn file() -> Self {
        Self::file_with(&Config::default())
    }

    /// Creates a file-based test database with `config`.
    pub fn file_with(config: &Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("test.htdb");
        let db = Database::open(&path, config).expect("Failed to open file database");
        Self {
            db,
            path: Some(path),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Closes the handle and opens the same file again with `config`.
    ///
    /// # Panics
    ///
    /// Panics for an in-memory database.
    pub fn reopen(&mut self, config: &Config) {
        let path = self.path.clone().expect("Only file databases can be reopened");
        // The old handle must be gone before the new one registers the file.
        let placeholder = Database::open_in_memory(&Config::default())
            .expect("Failed to open placeholder database");
        std::mem::replace(&mut self.db, placeholder)
            .close()
            .expect("Failed to close database");
        self.db = Database::open(&path, config).expect("Failed to reopen database");
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl std::ops::DerefMut for TestDatabase {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust
/// use htdb_core::StoreMode;
/// use htdb_testkit::with_temp_db;
///
/// with_temp_db(|db| {
///     db.store(b"key", b"value", StoreMode::Insert).unwrap();
///     assert_eq!(db.fetch(b"key").unwrap(), b"value");
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&mut Database) -> R,
{
    let mut test_db = TestDatabase::memory();
    f(&mut test_db.db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&mut Database, &Path) -> R,
{
    let mut test_db = TestDatabase::file();
    let path = test_db
        .path
        .clone()
        .expect("File database should have a path");
    f(&mut test_db.db, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Key of the `i`-th record stored by [`populate`].
    pub fn key(i: usize) -> Vec<u8> {
        format!("key-{i:05}").into_bytes()
    }

    /// Value of the `i`-th record stored by [`populate`].
    pub fn value(i: usize) -> Vec<u8> {
        format!("value-{i}-{}", "x".repeat(i % 37)).into_bytes()
    }

    /// Stores `count` records with [`key`] and [`value`].
    pub fn populate(db: &mut Database, count: usize) {
        for i in 0..count {
            db.store(&key(i), &value(i), StoreMode::Insert)
                .expect("Failed to store record");
        }
    }

    /// Creates an in-memory database with some pre-populated data.
    pub fn populated_database(count: usize) -> TestDatabase {
        let mut db = TestDatabase::memory();
        populate(&mut db, count);
        db
    }

    /// Creates a database whose keys all land in a handful of chains.
    pub fn crowded_database(hash_size: u32, count: usize) -> TestDatabase {
        let mut db = TestDatabase::memory_with(&Config::new().hash_table_size_hint(hash_size));
        populate(&mut db, count);
        db
    }
}
