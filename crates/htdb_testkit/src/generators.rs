//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random keys, values and operation
//! sequences.

use proptest::prelude::*;

/// Strategy for keys; short, so that sequences revisit them.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..8)
}

/// Strategy for values, mostly small with the occasional multi-page one.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        10 => prop::collection::vec(any::<u8>(), 0..128),
        1 => prop::collection::vec(any::<u8>(), 4096..20_000),
    ]
}

/// Strategy for hash table sizes, biased toward tiny tables with long
/// chains.
pub fn hash_size_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![3 => 1u32..4, 1 => 4u32..200]
}

/// One modification of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Store, inserting or replacing.
    Store(Vec<u8>, Vec<u8>),
    /// Append to the value, creating the key if missing.
    Append(Vec<u8>, Vec<u8>),
    /// Delete, which may find nothing.
    Delete(Vec<u8>),
}

/// Strategy for a single [`Mutation`].
pub fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        5 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Mutation::Store(k, v)),
        1 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Mutation::Append(k, v)),
        3 => key_strategy().prop_map(Mutation::Delete),
    ]
}

/// Strategy for a sequence of mutations.
pub fn mutations_strategy(max: usize) -> impl Strategy<Value = Vec<Mutation>> {
    prop::collection::vec(mutation_strategy(), 1..max)
}

/// Applies `mutation` to a map standing in for the database.
pub fn apply_to_model(model: &mut std::collections::BTreeMap<Vec<u8>, Vec<u8>>, mutation: &Mutation) {
    match mutation {
        Mutation::Store(k, v) => {
            model.insert(k.clone(), v.clone());
        }
        Mutation::Append(k, v) => model.entry(k.clone()).or_default().extend_from_slice(v),
        Mutation::Delete(k) => {
            model.remove(k);
        }
    }
}

/// Applies `mutation` to `db`, treating a missing key on delete as success.
pub fn apply_to_db(db: &mut htdb_core::Database, mutation: &Mutation) -> htdb_core::Result<()> {
    match mutation {
        Mutation::Store(k, v) => db.store(k, v, htdb_core::StoreMode::Either),
        Mutation::Append(k, v) => db.append(k, v),
        Mutation::Delete(k) => match db.delete(k) {
            Err(err) if err.kind() == htdb_core::ErrorKind::NoSuchKey => Ok(()),
            other => other,
        },
    }
}
