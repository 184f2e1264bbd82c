//! Traversal: visit every record, bucket by bucket.
//!
//! Each bucket stays locked while its records are handed to the callback,
//! and the transaction lock is held for reading throughout, so no
//! transaction can start on the file until the traversal ends. The
//! callback receives the handle and may modify the database, start a
//! nested traversal, or stop early.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::layout::BLOCK_HEADER_SIZE;
use crate::lock::TRANSACTION_LOCK;
use htdb_storage::{LockKind, LockWait};
use std::ops::ControlFlow;

type Visitor<'a> = dyn FnMut(&mut Database, &[u8], &[u8]) -> CoreResult<ControlFlow<()>> + 'a;

impl Database {
    /// Calls `visit` with every record's key and value, and returns the
    /// number of records visited.
    ///
    /// Records deleted by the callback before they are reached are
    /// skipped; records it inserts may or may not be visited.
    ///
    /// # Example
    ///
    /// ```rust
    /// use htdb_core::{Config, Database, StoreMode};
    /// use std::ops::ControlFlow;
    ///
    /// let mut db = Database::open_in_memory(&Config::default())?;
    /// db.store(b"a", b"1", StoreMode::Insert)?;
    /// db.store(b"b", b"2", StoreMode::Insert)?;
    ///
    /// let mut total = 0;
    /// let visited = db.traverse(|_, _, value| {
    ///     total += value.len();
    ///     Ok(ControlFlow::Continue(()))
    /// })?;
    /// assert_eq!((visited, total), (2, 2));
    /// # Ok::<(), htdb_core::CoreError>(())
    /// ```
    pub fn traverse<F>(&mut self, mut visit: F) -> CoreResult<usize>
    where
        F: FnMut(&mut Database, &[u8], &[u8]) -> CoreResult<ControlFlow<()>>,
    {
        let kind = if self.read_only || self.traverse_read_depth > 0 {
            LockKind::Read
        } else {
            LockKind::Write
        };
        let result = self.traverse_with(kind, false, &mut visit);
        self.track(result)
    }

    /// Like [`traverse`](Self::traverse), but with read locks; the callback
    /// cannot modify the database.
    pub fn traverse_read<F>(&mut self, mut visit: F) -> CoreResult<usize>
    where
        F: FnMut(&mut Database, &[u8], &[u8]) -> CoreResult<ControlFlow<()>>,
    {
        let result = self.traverse_with(LockKind::Read, true, &mut visit);
        self.track(result)
    }

    /// Returns every key.
    pub fn keys(&mut self) -> CoreResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        self.traverse_read(|_, key, _| {
            keys.push(key.to_vec());
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(keys)
    }

    fn traverse_with(
        &mut self,
        kind: LockKind,
        read: bool,
        visit: &mut Visitor<'_>,
    ) -> CoreResult<usize> {
        self.ensure_usable()?;
        self.lock_for_traversal()?;
        self.stats.record_traversal();

        if read {
            self.traverse_read_depth += 1;
        } else {
            self.traverse_depth += 1;
        }
        let result = self.traverse_buckets(kind, visit);
        if read {
            self.traverse_read_depth -= 1;
        } else {
            self.traverse_depth -= 1;
        }

        let unlocked = self.unlock_offset(TRANSACTION_LOCK);
        result.and_then(|count| unlocked.map(|()| count))
    }

    /// Takes the transaction lock for reading, replaying a crashed commit
    /// first if one is pending.
    fn lock_for_traversal(&mut self) -> CoreResult<()> {
        loop {
            let fresh = self.lock_offset(TRANSACTION_LOCK, LockKind::Read, LockWait::Wait)?;
            if !fresh || self.locks.allrecord().is_some() {
                return Ok(());
            }
            match self.recovery_pending() {
                Ok(false) => return Ok(()),
                Ok(true) => {
                    self.unlock_offset(TRANSACTION_LOCK)?;
                    self.lock_and_recover()?;
                }
                Err(err) => {
                    self.unlock_offset(TRANSACTION_LOCK)?;
                    return Err(err);
                }
            }
        }
    }

    fn traverse_buckets(&mut self, kind: LockKind, visit: &mut Visitor<'_>) -> CoreResult<usize> {
        let mut count = 0;
        for bucket in 0..self.header.hash_size {
            self.lock_bucket(bucket, kind)?;
            let result = self.traverse_chain(bucket, &mut count, visit);
            let unlocked = self.unlock_bucket(bucket);
            if result?.is_break() {
                unlocked?;
                return Ok(count);
            }
            unlocked?;
        }
        Ok(count)
    }

    /// Visits one chain from a snapshot of its members. Once the chain has
    /// been relinked, each remaining member is confirmed still present
    /// before it is visited.
    fn traverse_chain(
        &mut self,
        bucket: u32,
        count: &mut usize,
        visit: &mut Visitor<'_>,
    ) -> CoreResult<ControlFlow<()>> {
        let members = self.chain_members(bucket)?;
        let generation = self.generation;
        for member in members {
            if self.generation != generation && !self.chain_members(bucket)?.contains(&member) {
                continue;
            }
            let (offset, _) = member;
            let header = self.read_block(offset)?;
            let key = self.read(offset + BLOCK_HEADER_SIZE, header.key_len as usize)?;
            let value_len = usize::try_from(header.data_len)
                .map_err(|_| CoreError::corrupt("record value does not fit in memory"))?;
            let value = self.read(offset + BLOCK_HEADER_SIZE + key.len() as u64, value_len)?;
            *count += 1;
            if visit(self, &key, &value)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, ErrorKind, StoreMode};
    use std::collections::BTreeSet;

    fn filled(n: u32) -> Database {
        let mut db = Database::open_in_memory(&Config::new().hash_table_size_hint(2)).unwrap();
        for i in 0..n {
            db.store(format!("key{i}").as_bytes(), &i.to_le_bytes(), StoreMode::Insert)
                .unwrap();
        }
        db
    }

    #[test]
    fn visits_every_record_once() {
        let mut db = filled(9);
        let mut seen = Vec::new();
        let count = db
            .traverse(|_, key, _| {
                seen.push(key.to_vec());
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(count, 9);
        let unique: BTreeSet<_> = seen.iter().cloned().collect();
        assert_eq!(unique.len(), 9);
    }

    #[test]
    fn break_stops_early() {
        let mut db = filled(9);
        let count = db
            .traverse(|_, _, _| Ok(ControlFlow::Break(())))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn deleting_ahead_skips_the_deleted() {
        let mut db = filled(10);
        let mut seen = BTreeSet::new();
        let count = db
            .traverse(|db, key, _| {
                seen.insert(key.to_vec());
                for i in 0..10 {
                    let other = format!("key{i}").into_bytes();
                    if !seen.contains(&other) && db.exists(&other)? {
                        db.delete(&other)?;
                        break;
                    }
                }
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(count, seen.len());
        assert_eq!(db.keys().unwrap().len(), count);
        db.check().unwrap();
    }

    #[test]
    fn deleting_the_current_record_is_allowed() {
        let mut db = filled(6);
        let count = db
            .traverse(|db, key, _| {
                db.delete(key)?;
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(count, 6);
        assert!(db.keys().unwrap().is_empty());
    }

    #[test]
    fn read_traversal_refuses_writes() {
        let mut db = filled(3);
        let err = db
            .traverse_read(|db, key, _| {
                db.delete(key)?;
                Ok(ControlFlow::Continue(()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
        db.delete(b"key0").unwrap();
    }

    #[test]
    fn nested_traversal_sees_everything() {
        let mut db = filled(5);
        let mut inner_counts = Vec::new();
        db.traverse(|db, _, _| {
            inner_counts.push(db.traverse(|_, _, _| Ok(ControlFlow::Continue(())))?);
            // The inner traversal only drops its own hold.
            assert_eq!(db.locks.held(TRANSACTION_LOCK), Some(LockKind::Read));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
        assert_eq!(inner_counts, vec![5; 5]);
        assert_eq!(db.locks.held(TRANSACTION_LOCK), None);
    }

    #[test]
    fn transaction_start_inside_traversal_would_block() {
        let mut db = filled(2);
        db.traverse(|db, _, _| {
            assert!(matches!(db.transaction_start(), Err(CoreError::WouldBlock)));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
        db.transaction_start().unwrap();
        db.transaction_cancel().unwrap();
    }

    #[test]
    fn callback_error_ends_traversal_and_releases_locks() {
        let mut db = filled(4);
        let err = db
            .traverse(|_, _, _| Err(CoreError::invalid_argument("stop")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        db.lock_all().unwrap();
        db.unlock_all().unwrap();
    }

    #[test]
    fn traversal_inside_transaction_sees_uncommitted() {
        let mut db = filled(2);
        db.transaction_start().unwrap();
        db.store(b"extra", b"x", StoreMode::Insert).unwrap();
        assert_eq!(db.keys().unwrap().len(), 3);
        db.transaction_cancel().unwrap();
        assert_eq!(db.keys().unwrap().len(), 2);
    }
}
