//! Benchmark utilities.

use htdb_core::{Config, Database, StoreMode};
use rand::Rng;
use tempfile::TempDir;

/// Generate random data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Key of the `i`-th benchmark record.
pub fn key(i: usize) -> Vec<u8> {
    format!("bench-key-{i:08}").into_bytes()
}

/// Opens a database file in a fresh temporary directory.
///
/// Commits skip `fsync`, so the numbers measure the engine rather than
/// the disk.
pub fn temp_database(hash_size: u32) -> (TempDir, Database) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let config = Config::new()
        .hash_table_size_hint(hash_size)
        .disable_auto_fsync(true);
    let db = Database::open(dir.path().join("bench.htdb"), &config)
        .expect("Failed to open database");
    (dir, db)
}

/// Stores `count` records of `size` random bytes.
pub fn populate(db: &mut Database, count: usize, size: usize) {
    let data = random_data(size);
    for i in 0..count {
        db.store(&key(i), &data, StoreMode::Either)
            .expect("Failed to store record");
    }
}
