//! Per-handle operation counters.
//!
//! # Usage
//!
//! ```rust
//! use htdb_core::{Config, Database, StoreMode};
//!
//! let mut db = Database::open_in_memory(&Config::default())?;
//! db.store(b"k", b"v", StoreMode::Either)?;
//!
//! let stats = db.stats();
//! println!("Stores: {}", stats.stores);
//! println!("Commits: {}", stats.transactions_committed);
//! # Ok::<(), htdb_core::CoreError>(())
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Database statistics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    // Record counters
    fetches: AtomicU64,
    stores: AtomicU64,
    deletes: AtomicU64,
    traversals: AtomicU64,

    // Bytes counters
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,

    // File counters
    expansions: AtomicU64,
    recoveries: AtomicU64,

    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_cancelled: AtomicU64,

    errors: AtomicU64,
}

impl DatabaseStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_fetch(&self, bytes: u64) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_store(&self, bytes: u64) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_traversal(&self) {
        self.traversals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expansion(&self) {
        self.expansions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_cancel(&self) {
        self.transactions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of fetches.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Returns the number of stores, including appends.
    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Returns the number of deletes.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Returns the number of traversals started.
    pub fn traversals(&self) -> u64 {
        self.traversals.load(Ordering::Relaxed)
    }

    /// Returns the number of times the data area grew.
    pub fn expansions(&self) -> u64 {
        self.expansions.load(Ordering::Relaxed)
    }

    /// Returns the number of journals replayed by this handle.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions cancelled, explicitly or by a
    /// failed commit.
    pub fn transactions_cancelled(&self) -> u64 {
        self.transactions_cancelled.load(Ordering::Relaxed)
    }

    /// Returns the number of public calls that failed.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fetches: self.fetches(),
            stores: self.stores(),
            deletes: self.deletes(),
            traversals: self.traversals(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            expansions: self.expansions(),
            recoveries: self.recoveries(),
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_cancelled: self.transactions_cancelled(),
            errors: self.errors(),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Number of fetches.
    pub fetches: u64,
    /// Number of stores.
    pub stores: u64,
    /// Number of deletes.
    pub deletes: u64,
    /// Number of traversals.
    pub traversals: u64,
    /// Key and value bytes stored.
    pub bytes_written: u64,
    /// Value bytes fetched.
    pub bytes_read: u64,
    /// Number of data-area expansions.
    pub expansions: u64,
    /// Number of journals replayed.
    pub recoveries: u64,
    /// Number of transactions started.
    pub transactions_started: u64,
    /// Number of transactions committed.
    pub transactions_committed: u64,
    /// Number of transactions cancelled.
    pub transactions_cancelled: u64,
    /// Number of failed calls.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = DatabaseStats::new();
        assert_eq!(stats.fetches(), 0);
        assert_eq!(stats.stores(), 0);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_operations() {
        let stats = DatabaseStats::new();

        stats.record_fetch(100);
        stats.record_fetch(50);
        stats.record_store(200);
        stats.record_delete();

        let snap = stats.snapshot();
        assert_eq!(snap.fetches, 2);
        assert_eq!(snap.bytes_read, 150);
        assert_eq!(snap.stores, 1);
        assert_eq!(snap.bytes_written, 200);
        assert_eq!(snap.deletes, 1);
    }

    #[test]
    fn record_transactions() {
        let stats = DatabaseStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_commit();
        stats.record_transaction_cancel();

        assert_eq!(stats.transactions_started(), 2);
        assert_eq!(stats.transactions_committed(), 1);
        assert_eq!(stats.transactions_cancelled(), 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(DatabaseStats::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_fetch(1);
                    s.record_error();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.fetches(), 1000);
        assert_eq!(stats.errors(), 1000);
    }
}
