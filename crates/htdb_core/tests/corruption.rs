//! Single-bit corruption sweep.
//!
//! Every bit of a small database file is flipped in turn and the checker
//! run against it. The number of flips it reports must equal the number
//! of verifiable bits, computed from the layout sizes alone.

#![cfg(unix)]

use htdb_core::{
    Config, Database, ErrorKind, LogLevel, StoreMode, FREE_CLASSES, FREE_VERIFIABLE_BYTES,
    HEADER_VERIFIABLE_BYTES, MIN_BLOCK_SIZE,
};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

const HASH_SIZE: u32 = 2;
const KEYS: [&str; 5] = ["h", "he", "hel", "hell", "hello"];
const VALUE: &[u8] = b"world";

fn flip(file: &File, bit: u64) {
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, bit / 8).unwrap();
    byte[0] ^= 1 << (bit % 8);
    file.write_all_at(&byte, bit / 8).unwrap();
}

fn stored_pair(key: &[u8], value: &[u8]) -> bool {
    value == VALUE && KEYS.iter().any(|k| k.as_bytes() == key)
}

fn sweep(path: &Path, disable_mmap: bool) {
    let logged = Arc::new(AtomicUsize::new(0));
    let sink_logged = Arc::clone(&logged);
    let config = Config::new()
        .hash_table_size_hint(HASH_SIZE)
        .disable_mmap(disable_mmap)
        .log_sink(Arc::new(move |_: LogLevel, _: ErrorKind, _: &str| {
            sink_logged.fetch_add(1, Ordering::Relaxed);
        }));

    let mut db = Database::open(path, &config).unwrap();
    for key in KEYS {
        db.store(key.as_bytes(), VALUE, StoreMode::Insert).unwrap();
    }
    db.check_with(stored_pair).unwrap();

    let summary = db.summary().unwrap();
    let live: u64 = KEYS
        .iter()
        .map(|key| MIN_BLOCK_SIZE + key.len() as u64 + VALUE.len() as u64)
        .sum();
    let expected = 8
        * (HEADER_VERIFIABLE_BYTES
            + 8 * (FREE_CLASSES + u64::from(HASH_SIZE))
            + live
            + FREE_VERIFIABLE_BYTES * summary.free_blocks);

    // Kept open for the whole sweep: closing any descriptor on the file
    // would drop the locks the handle holds.
    let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let bits = file.metadata().unwrap().len() * 8;

    db.set_logging_suppressed(true);
    let mut detected = 0u64;
    for bit in 0..bits {
        flip(&file, bit);
        match db.check_with(stored_pair) {
            Ok(()) => {}
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::Corrupt, "bit {bit}: {err}");
                detected += 1;
            }
        }
        flip(&file, bit);
    }
    db.set_logging_suppressed(false);

    assert_eq!(detected, expected);
    assert_eq!(logged.load(Ordering::Relaxed), 0);
    db.check_with(stored_pair).unwrap();
    db.close().unwrap();
    drop(file);
}

#[test]
fn every_verifiable_bit_is_detected_mapped() {
    let dir = tempdir().unwrap();
    sweep(&dir.path().join("mapped.htdb"), false);
}

#[test]
fn every_verifiable_bit_is_detected_unmapped() {
    let dir = tempdir().unwrap();
    sweep(&dir.path().join("unmapped.htdb"), true);
}
