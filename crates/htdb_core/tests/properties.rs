//! Property tests against an in-memory model.

use htdb_core::{Config, Database, ErrorKind, StoreMode};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Store(Vec<u8>, Vec<u8>),
    Insert(Vec<u8>, Vec<u8>),
    Append(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    Commit(Vec<(Vec<u8>, Vec<u8>)>),
    Cancel(Vec<(Vec<u8>, Vec<u8>)>),
}

fn key() -> impl Strategy<Value = Vec<u8>> {
    vec(any::<u8>(), 0..6)
}

fn value() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        8 => vec(any::<u8>(), 0..64),
        1 => vec(any::<u8>(), 1000..5000),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (key(), value()).prop_map(|(k, v)| Op::Store(k, v)),
        2 => (key(), value()).prop_map(|(k, v)| Op::Insert(k, v)),
        1 => (key(), value()).prop_map(|(k, v)| Op::Append(k, v)),
        3 => key().prop_map(Op::Delete),
        1 => vec((key(), value()), 0..5).prop_map(Op::Commit),
        1 => vec((key(), value()), 0..5).prop_map(Op::Cancel),
    ]
}

fn open(hash_size: u32) -> Database {
    Database::open_in_memory(&Config::new().hash_table_size_hint(hash_size)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn operations_agree_with_model(hash_size in 1u32..8, ops in vec(op(), 1..60)) {
        let mut db = open(hash_size);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Store(k, v) => {
                    db.store(&k, &v, StoreMode::Either).unwrap();
                    model.insert(k, v);
                }
                Op::Insert(k, v) => {
                    let result = db.store(&k, &v, StoreMode::Insert);
                    if model.contains_key(&k) {
                        prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::AlreadyExists);
                    } else {
                        result.unwrap();
                        model.insert(k, v);
                    }
                }
                Op::Append(k, v) => {
                    db.append(&k, &v).unwrap();
                    model.entry(k).or_default().extend_from_slice(&v);
                }
                Op::Delete(k) => {
                    let result = db.delete(&k);
                    if model.remove(&k).is_some() {
                        result.unwrap();
                    } else {
                        prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::NoSuchKey);
                    }
                }
                Op::Commit(pairs) => {
                    db.transaction(|db| {
                        for (k, v) in &pairs {
                            db.store(k, v, StoreMode::Either)?;
                        }
                        Ok(())
                    })
                    .unwrap();
                    model.extend(pairs);
                }
                Op::Cancel(pairs) => {
                    db.transaction_start().unwrap();
                    for (k, v) in &pairs {
                        db.store(k, v, StoreMode::Either).unwrap();
                    }
                    db.transaction_cancel().unwrap();
                }
            }
        }

        for (k, v) in &model {
            prop_assert_eq!(&db.fetch(k).unwrap(), v);
        }
        let mut keys = db.keys().unwrap();
        keys.sort();
        prop_assert_eq!(keys, model.keys().cloned().collect::<Vec<_>>());
        db.check_with(|k, v| model.get(k).is_some_and(|expected| expected == v)).unwrap();
    }

    #[test]
    fn stored_values_round_trip(pairs in vec((key(), value()), 1..20)) {
        let mut db = open(3);
        let mut model = BTreeMap::new();
        for (k, v) in pairs {
            db.store(&k, &v, StoreMode::Either).unwrap();
            model.insert(k, v);
        }
        for (k, v) in &model {
            prop_assert_eq!(&db.fetch(k).unwrap(), v);
        }
        db.check().unwrap();
    }
}

#[test]
fn multi_megabyte_values_round_trip() {
    let mut db = open(17);
    let big: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    db.store(b"big", &big, StoreMode::Insert).unwrap();
    db.store(b"small", b"s", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"big").unwrap(), big);

    let bigger: Vec<u8> = big.iter().rev().copied().chain(big.iter().copied()).collect();
    db.store(b"big", &bigger, StoreMode::Replace).unwrap();
    assert_eq!(db.fetch(b"big").unwrap(), bigger);
    assert_eq!(db.fetch(b"small").unwrap(), b"s");
    db.check().unwrap();
}
