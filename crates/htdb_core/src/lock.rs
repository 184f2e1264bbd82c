//! Per-handle bookkeeping of advisory byte-range locks.
//!
//! `fcntl` locks belong to the process: the OS happily grants a process a
//! lock it already holds, and releasing a range once drops it no matter how
//! many times it was taken. [`LockManager`] therefore counts every hold,
//! makes only the first request and the last release reach the OS, and
//! refuses requests the OS would silently get wrong (upgrades of a held
//! bucket lock, an all-record lock over held bucket locks).
//!
//! Offsets:
//!
//! | offset     | lock |
//! |------------|------|
//! | 0          | open (creation, first-open wipe, open-time recovery) |
//! | 4          | active (shared while open) |
//! | 8          | transaction |
//! | 12         | allocator; start of the all-record range |
//! | 16 + b     | bucket `b` |

use crate::error::{CoreError, CoreResult};
use htdb_storage::{LockKind, LockWait, StorageBackend, StorageError};
use std::collections::HashMap;

/// Held while opening, creating or wiping the file.
pub(crate) const OPEN_LOCK: u64 = 0;
/// Shared by every open handle; the first opener can take it exclusively.
pub(crate) const ACTIVE_LOCK: u64 = 4;
/// Held for the whole of a transaction.
pub(crate) const TRANSACTION_LOCK: u64 = 8;
/// Serializes free-list and data-end updates.
pub(crate) const ALLOC_LOCK: u64 = 12;
/// The all-record lock covers everything from here to the end of the file.
pub(crate) const ALLRECORD_START: u64 = ALLOC_LOCK;
const BUCKET_LOCK_BASE: u64 = 16;

/// Lock offset of a bucket.
pub(crate) const fn bucket_lock(bucket: u32) -> u64 {
    BUCKET_LOCK_BASE + bucket as u64
}

#[derive(Debug, Clone, Copy)]
struct Held {
    kind: LockKind,
    count: u32,
    /// Granted under the all-record lock without an OS call.
    covered: bool,
}

#[derive(Debug, Clone, Copy)]
struct AllRecord {
    kind: LockKind,
    count: u32,
}

/// Locks one handle holds.
#[derive(Debug, Default)]
pub(crate) struct LockManager {
    held: HashMap<u64, Held>,
    allrecord: Option<AllRecord>,
}

fn os_error(err: StorageError, what: &str) -> CoreError {
    if err.is_would_block() {
        CoreError::WouldBlock
    } else {
        CoreError::lock(format!("{what}: {err}"))
    }
}

impl LockManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes one byte-range lock.
    ///
    /// `in_transaction` lets a transaction take write locks on records
    /// under its read all-record lock; its writes only reach the file at
    /// commit, after the all-record lock is upgraded.
    ///
    /// Returns true if the lock was newly acquired from the OS.
    pub(crate) fn lock(
        &mut self,
        io: &dyn StorageBackend,
        offset: u64,
        kind: LockKind,
        wait: LockWait,
        in_transaction: bool,
    ) -> CoreResult<bool> {
        if let Some(held) = self.held.get_mut(&offset) {
            if kind > held.kind {
                return Err(CoreError::lock(format!(
                    "cannot upgrade read lock at offset {offset}"
                )));
            }
            held.count += 1;
            return Ok(false);
        }

        if offset >= ALLRECORD_START {
            if let Some(all) = self.allrecord {
                if kind > all.kind && !in_transaction {
                    return Err(CoreError::lock(format!(
                        "write lock at offset {offset} requested under a read all-record lock"
                    )));
                }
                self.held.insert(
                    offset,
                    Held {
                        kind,
                        count: 1,
                        covered: true,
                    },
                );
                return Ok(false);
            }
        }

        io.lock(offset, 1, kind, wait)
            .map_err(|err| os_error(err, "lock"))?;
        self.held.insert(
            offset,
            Held {
                kind,
                count: 1,
                covered: false,
            },
        );
        Ok(true)
    }

    /// Releases one hold of a byte-range lock.
    pub(crate) fn unlock(&mut self, io: &dyn StorageBackend, offset: u64) -> CoreResult<()> {
        let Some(held) = self.held.get_mut(&offset) else {
            return Err(CoreError::lock(format!("lock at offset {offset} is not held")));
        };
        held.count -= 1;
        if held.count > 0 {
            return Ok(());
        }
        let covered = held.covered;
        self.held.remove(&offset);
        if !covered {
            io.unlock(offset, 1).map_err(|err| os_error(err, "unlock"))?;
        }
        Ok(())
    }

    /// Returns the kind of lock held at `offset`, if any.
    pub(crate) fn held(&self, offset: u64) -> Option<LockKind> {
        self.held.get(&offset).map(|held| held.kind)
    }

    /// Returns the kind of the all-record lock, if held.
    pub(crate) fn allrecord(&self) -> Option<LockKind> {
        self.allrecord.map(|all| all.kind)
    }

    /// Returns true if any allocator or bucket lock is held.
    pub(crate) fn holds_record_locks(&self) -> bool {
        self.held.keys().any(|&offset| offset >= ALLRECORD_START)
    }

    /// Returns true if any lock is held besides the active lock every
    /// open handle keeps.
    pub(crate) fn holds_operation_locks(&self) -> bool {
        self.held.keys().any(|&offset| offset != ACTIVE_LOCK) || self.allrecord.is_some()
    }

    /// Takes the all-record lock.
    pub(crate) fn lock_all(
        &mut self,
        io: &dyn StorageBackend,
        kind: LockKind,
        wait: LockWait,
    ) -> CoreResult<()> {
        if let Some(all) = &mut self.allrecord {
            if kind > all.kind {
                return Err(CoreError::lock("cannot upgrade a read all-record lock"));
            }
            all.count += 1;
            return Ok(());
        }
        if self.holds_record_locks() {
            return Err(CoreError::lock(
                "cannot take the all-record lock while holding record locks",
            ));
        }
        io.lock(ALLRECORD_START, 0, kind, wait)
            .map_err(|err| os_error(err, "all-record lock"))?;
        self.allrecord = Some(AllRecord { kind, count: 1 });
        Ok(())
    }

    /// Releases one hold of the all-record lock.
    ///
    /// The last release is refused while record locks it covers are still
    /// held, unless `force` is set; those locks then stay counted but no
    /// longer protect anything.
    pub(crate) fn unlock_all(&mut self, io: &dyn StorageBackend, force: bool) -> CoreResult<()> {
        let Some(all) = &mut self.allrecord else {
            return Err(CoreError::lock("all-record lock is not held"));
        };
        if all.count > 1 {
            all.count -= 1;
            return Ok(());
        }
        if !force && self.held.values().any(|held| held.covered) {
            return Err(CoreError::lock(
                "cannot release the all-record lock while record locks are held",
            ));
        }
        self.allrecord = None;
        io.unlock(ALLRECORD_START, 0)
            .map_err(|err| os_error(err, "all-record unlock"))
    }

    /// Turns a held read all-record lock into a write lock, blocking.
    pub(crate) fn upgrade_all(&mut self, io: &dyn StorageBackend) -> CoreResult<()> {
        let Some(all) = &mut self.allrecord else {
            return Err(CoreError::lock("all-record lock is not held"));
        };
        if all.kind == LockKind::Write {
            return Ok(());
        }
        io.lock(ALLRECORD_START, 0, LockKind::Write, LockWait::Wait)
            .map_err(|err| os_error(err, "all-record upgrade"))?;
        all.kind = LockKind::Write;
        Ok(())
    }

    /// Turns a held write all-record lock back into a read lock.
    pub(crate) fn downgrade_all(&mut self, io: &dyn StorageBackend) -> CoreResult<()> {
        let Some(all) = &mut self.allrecord else {
            return Err(CoreError::lock("all-record lock is not held"));
        };
        if all.kind == LockKind::Read {
            return Ok(());
        }
        io.lock(ALLRECORD_START, 0, LockKind::Read, LockWait::Wait)
            .map_err(|err| os_error(err, "all-record downgrade"))?;
        all.kind = LockKind::Read;
        Ok(())
    }

    /// Drops every lock, returning the first OS error.
    pub(crate) fn release_everything(&mut self, io: &dyn StorageBackend) -> CoreResult<()> {
        let mut first = None;
        for (offset, held) in self.held.drain() {
            if !held.covered {
                if let Err(err) = io.unlock(offset, 1) {
                    first.get_or_insert(os_error(err, "unlock"));
                }
            }
        }
        if self.allrecord.take().is_some() {
            if let Err(err) = io.unlock(ALLRECORD_START, 0) {
                first.get_or_insert(os_error(err, "all-record unlock"));
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htdb_storage::{InMemoryBackend, StorageResult};
    use parking_lot::Mutex;

    /// Records every OS-level request.
    #[derive(Default)]
    struct Recording {
        inner: InMemoryBackend,
        calls: Mutex<Vec<(&'static str, u64, u64)>>,
    }

    impl StorageBackend for Recording {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }
        fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
            self.inner.write_at(offset, data)
        }
        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }
        fn grow(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.grow(new_size)
        }
        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn lock(&self, offset: u64, len: u64, _: LockKind, _: LockWait) -> StorageResult<()> {
            self.calls.lock().push(("lock", offset, len));
            Ok(())
        }
        fn unlock(&self, offset: u64, len: u64) -> StorageResult<()> {
            self.calls.lock().push(("unlock", offset, len));
            Ok(())
        }
    }

    #[test]
    fn nested_locks_reach_os_once() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        let bucket = bucket_lock(3);

        assert!(locks.lock(&io, bucket, LockKind::Write, LockWait::Wait, false).unwrap());
        assert!(!locks.lock(&io, bucket, LockKind::Read, LockWait::Wait, false).unwrap());
        locks.unlock(&io, bucket).unwrap();
        assert_eq!(locks.held(bucket), Some(LockKind::Write));
        locks.unlock(&io, bucket).unwrap();
        assert_eq!(locks.held(bucket), None);

        assert_eq!(
            *io.calls.lock(),
            vec![("lock", 19, 1), ("unlock", 19, 1)]
        );
    }

    #[test]
    fn read_to_write_upgrade_is_refused() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        locks.lock(&io, bucket_lock(0), LockKind::Read, LockWait::Wait, false).unwrap();
        let err = locks
            .lock(&io, bucket_lock(0), LockKind::Write, LockWait::Wait, false)
            .unwrap_err();
        assert!(matches!(err, CoreError::Lock { .. }));
    }

    #[test]
    fn unlock_of_unheld_lock_fails() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        assert!(locks.unlock(&io, bucket_lock(1)).is_err());
        assert!(locks.unlock_all(&io, false).is_err());
    }

    #[test]
    fn allrecord_covers_buckets() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        locks.lock_all(&io, LockKind::Write, LockWait::Wait).unwrap();
        assert!(!locks.lock(&io, bucket_lock(7), LockKind::Write, LockWait::Wait, false).unwrap());
        assert!(!locks.lock(&io, ALLOC_LOCK, LockKind::Write, LockWait::Wait, false).unwrap());

        // Covered locks keep the all-record lock alive.
        assert!(locks.unlock_all(&io, false).is_err());
        locks.unlock(&io, bucket_lock(7)).unwrap();
        locks.unlock(&io, ALLOC_LOCK).unwrap();
        locks.unlock_all(&io, false).unwrap();

        assert_eq!(
            *io.calls.lock(),
            vec![("lock", 12, 0), ("unlock", 12, 0)]
        );
    }

    #[test]
    fn write_under_read_allrecord_needs_transaction() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        locks.lock_all(&io, LockKind::Read, LockWait::Wait).unwrap();
        assert!(locks
            .lock(&io, bucket_lock(0), LockKind::Write, LockWait::Wait, false)
            .is_err());
        assert!(!locks
            .lock(&io, bucket_lock(0), LockKind::Write, LockWait::Wait, true)
            .unwrap());
    }

    #[test]
    fn allrecord_refused_over_bucket_locks() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        locks.lock(&io, bucket_lock(2), LockKind::Read, LockWait::Wait, false).unwrap();
        assert!(locks.lock_all(&io, LockKind::Read, LockWait::Wait).is_err());

        // The transaction lock sits below the all-record range.
        locks.unlock(&io, bucket_lock(2)).unwrap();
        locks
            .lock(&io, TRANSACTION_LOCK, LockKind::Write, LockWait::Wait, false)
            .unwrap();
        locks.lock_all(&io, LockKind::Read, LockWait::Wait).unwrap();
        assert!(locks.holds_operation_locks());
        assert!(!locks.holds_record_locks());
    }

    #[test]
    fn upgrade_and_downgrade_allrecord() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        assert!(locks.upgrade_all(&io).is_err());

        locks.lock_all(&io, LockKind::Read, LockWait::Wait).unwrap();
        assert!(locks.lock_all(&io, LockKind::Write, LockWait::Wait).is_err());
        locks.upgrade_all(&io).unwrap();
        assert_eq!(locks.allrecord(), Some(LockKind::Write));
        locks.downgrade_all(&io).unwrap();
        assert_eq!(locks.allrecord(), Some(LockKind::Read));
    }

    #[test]
    fn active_lock_alone_is_not_an_operation_lock() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        locks.lock(&io, ACTIVE_LOCK, LockKind::Read, LockWait::Wait, false).unwrap();
        assert!(!locks.holds_operation_locks());
        locks.lock(&io, TRANSACTION_LOCK, LockKind::Write, LockWait::Wait, false).unwrap();
        assert!(locks.holds_operation_locks());
    }

    #[test]
    fn release_everything_clears_state() {
        let io = Recording::default();
        let mut locks = LockManager::new();
        locks.lock(&io, ACTIVE_LOCK, LockKind::Read, LockWait::Wait, false).unwrap();
        locks.lock(&io, TRANSACTION_LOCK, LockKind::Write, LockWait::Wait, false).unwrap();
        locks.lock_all(&io, LockKind::Read, LockWait::Wait).unwrap();
        locks.lock(&io, bucket_lock(0), LockKind::Read, LockWait::Wait, false).unwrap();

        assert!(locks.holds_operation_locks());
        locks.release_everything(&io).unwrap();
        assert!(!locks.holds_operation_locks());
        let unlocks = io
            .calls
            .lock()
            .iter()
            .filter(|(op, _, _)| *op == "unlock")
            .count();
        // The covered bucket lock never reached the OS.
        assert_eq!(unlocks, 3);
    }
}
