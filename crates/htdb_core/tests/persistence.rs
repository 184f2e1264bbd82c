//! Behavior across close and reopen of a real file.

use htdb_core::{Config, Database, ErrorKind, StoreMode};
use std::ops::ControlFlow;
use tempfile::tempdir;

#[test]
fn committed_transaction_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.htdb");

    let mut db = Database::open(&path, &Config::default()).unwrap();
    db.store(b"kept", b"1", StoreMode::Insert).unwrap();
    db.transaction(|db| {
        db.store(b"kept", b"2", StoreMode::Replace)?;
        db.store(b"added", b"3", StoreMode::Insert)
    })
    .unwrap();
    let sequence = db.sequence_number().unwrap();
    db.close().unwrap();

    let mut db = Database::open(&path, &Config::default()).unwrap();
    assert_eq!(db.fetch(b"kept").unwrap(), b"2");
    assert_eq!(db.fetch(b"added").unwrap(), b"3");
    assert_eq!(db.sequence_number().unwrap(), sequence);
    db.check().unwrap();
}

#[test]
fn cancelled_transaction_leaves_file_identical() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.htdb");

    let mut db = Database::open(&path, &Config::new().hash_table_size_hint(5)).unwrap();
    for i in 0..20u32 {
        db.store(format!("k{i}").as_bytes(), &i.to_be_bytes(), StoreMode::Insert)
            .unwrap();
    }
    let before = std::fs::read(&path).unwrap();

    db.transaction_start().unwrap();
    for i in 0..20u32 {
        db.delete(format!("k{i}").as_bytes()).unwrap();
    }
    db.store(b"big", &vec![7u8; 64 * 1024], StoreMode::Insert).unwrap();
    db.transaction_cancel().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), before);
    db.check().unwrap();
}

#[test]
fn close_cancels_active_transaction() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.htdb");

    let mut db = Database::open(&path, &Config::default()).unwrap();
    db.store(b"a", b"1", StoreMode::Insert).unwrap();
    db.transaction_start().unwrap();
    db.delete(b"a").unwrap();
    db.close().unwrap();

    let mut db = Database::open(&path, &Config::default()).unwrap();
    assert_eq!(db.fetch(b"a").unwrap(), b"1");
}

#[test]
fn traversal_with_two_buckets_is_complete() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.htdb");
    let keys = ["one", "two", "three", "four", "five", "six", "seven"];

    let mut db = Database::open(&path, &Config::new().hash_table_size_hint(2)).unwrap();
    for key in keys {
        db.store(key.as_bytes(), key.as_bytes(), StoreMode::Insert).unwrap();
    }
    db.close().unwrap();

    let mut db = Database::open(&path, &Config::new().read_only(true)).unwrap();
    let mut seen = Vec::new();
    let count = db
        .traverse(|_, key, value| {
            assert_eq!(key, value);
            seen.push(String::from_utf8(key.to_vec()).unwrap());
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
    seen.sort();
    let mut expected: Vec<_> = keys.iter().map(ToString::to_string).collect();
    expected.sort();
    assert_eq!(count, keys.len());
    assert_eq!(seen, expected);
    assert_eq!(
        db.store(b"x", b"y", StoreMode::Insert).unwrap_err().kind(),
        ErrorKind::ReadOnly
    );
}

#[test]
fn deleted_space_is_reused_without_growth() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.htdb");

    let mut db = Database::open(&path, &Config::default()).unwrap();
    for round in 0..50u32 {
        db.store(b"churn", &vec![round as u8; 300], StoreMode::Either)
            .unwrap();
        db.store(b"other", &vec![round as u8; 700], StoreMode::Either)
            .unwrap();
        db.delete(b"other").unwrap();
    }
    let size = std::fs::metadata(&path).unwrap().len();
    for round in 0..50u32 {
        db.store(b"other", &vec![round as u8; 700], StoreMode::Insert)
            .unwrap();
        db.delete(b"other").unwrap();
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    db.check().unwrap();
}

#[test]
fn clear_if_first_wipes_only_for_the_first_opener() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.htdb");

    let mut db = Database::open(&path, &Config::default()).unwrap();
    db.store(b"stale", b"1", StoreMode::Insert).unwrap();
    db.close().unwrap();

    let mut db = Database::open(&path, &Config::new().clear_if_first(true)).unwrap();
    assert_eq!(db.fetch(b"stale").unwrap_err().kind(), ErrorKind::NoSuchKey);
}
