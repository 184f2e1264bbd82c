//! Transactions with crash-safe commit.
//!
//! A transaction holds the transaction lock (write) and the all-record lock
//! (read) from start to commit or cancel, and buffers every write in a page
//! overlay. Commit writes a journal past the end of the data, makes it
//! durable, points the header at it, applies it and clears the pointer.
//! A crash before the header points at the journal leaves the old image;
//! a crash after it leaves a journal the next lock holder replays.

mod journal;
mod state;

pub(crate) use state::Transaction;

use crate::database::Database;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::layout::{align_up, field, get_u64, ALIGNMENT};
use crate::lock::TRANSACTION_LOCK;
use crate::log::LogLevel;
use journal::{journal_len, Journal, JOURNAL_HEADER_SIZE};
use htdb_storage::{LockKind, LockWait};
use state::Prepared;
use tracing::{debug, info, warn};

impl Database {
    /// Starts a transaction, waiting for any other transaction on the file
    /// to finish.
    ///
    /// Until [`transaction_commit`](Self::transaction_commit) nothing this
    /// handle writes reaches the file, and other handles keep seeing the
    /// old contents.
    ///
    /// # Errors
    ///
    /// - `WouldBlock` inside a traversal on this handle
    /// - `InvalidArgument` if a transaction is active and nesting is off
    /// - `Lock` if the handle holds chain or all-record locks
    pub fn transaction_start(&mut self) -> CoreResult<()> {
        let result = self.begin_transaction(LockWait::Wait);
        self.track(result)
    }

    /// Starts a transaction, failing with `WouldBlock` instead of waiting
    /// when another handle has one active.
    pub fn try_transaction_start(&mut self) -> CoreResult<()> {
        let result = self.begin_transaction(LockWait::NoWait);
        self.track(result)
    }

    /// Returns true while a transaction is active.
    #[must_use]
    pub fn transaction_active(&self) -> bool {
        self.transaction.is_some()
    }

    /// Runs `f` in a transaction, committing if it returns `Ok` and
    /// cancelling otherwise.
    ///
    /// # Example
    ///
    /// ```rust
    /// use htdb_core::{Config, Database, StoreMode};
    ///
    /// let mut db = Database::open_in_memory(&Config::default())?;
    /// db.transaction(|db| {
    ///     db.store(b"a", b"1", StoreMode::Insert)?;
    ///     db.store(b"b", b"2", StoreMode::Insert)
    /// })?;
    /// assert_eq!(db.fetch(b"b")?, b"2");
    /// # Ok::<(), htdb_core::CoreError>(())
    /// ```
    pub fn transaction<F, T>(&mut self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Self) -> CoreResult<T>,
    {
        self.transaction_start()?;
        match f(self) {
            Ok(value) => {
                self.transaction_commit()?;
                Ok(value)
            }
            Err(err) => {
                if self.transaction.is_some() {
                    if let Err(cancel) = self.transaction_cancel() {
                        warn!(name = %self.name(), error = %cancel, "cancelling transaction failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn begin_transaction(&mut self, wait: LockWait) -> CoreResult<()> {
        self.ensure_usable()?;
        if self.traverse_depth > 0 || self.traverse_read_depth > 0 {
            return Err(CoreError::WouldBlock);
        }
        if self.read_only {
            return Err(CoreError::ReadOnly);
        }
        if let Some(tx) = &mut self.transaction {
            if !self.allow_nesting {
                return Err(CoreError::invalid_argument(
                    "a transaction is already active and nesting is disabled",
                ));
            }
            tx.nesting += 1;
            return Ok(());
        }
        if self.locks.holds_operation_locks() {
            let err = CoreError::lock("cannot start a transaction while holding locks");
            self.log.log(LogLevel::UseError, ErrorKind::Lock, &err.to_string());
            return Err(err);
        }

        self.lock_offset(TRANSACTION_LOCK, LockKind::Write, wait)?;
        if let Err(err) = self.lock_all_raw(LockKind::Read, wait) {
            let unlocked = self.unlock_offset(TRANSACTION_LOCK);
            return unlocked.and(Err(err));
        }
        if let Err(err) = self.begin_locked() {
            let released = self.release_transaction_locks();
            return released.and(Err(err));
        }
        self.stats.record_transaction_start();
        debug!(name = %self.name(), "transaction started");
        Ok(())
    }

    /// Runs with both transaction locks held.
    fn begin_locked(&mut self) -> CoreResult<()> {
        if self.recovery_pending()? {
            self.upgrade_all_raw()?;
            let recovered = self.recover();
            let downgraded = self.downgrade_all_raw();
            recovered?;
            downgraded?;
        }
        self.transaction = Some(Transaction::new(self.io.size()?));
        Ok(())
    }

    fn release_transaction_locks(&mut self) -> CoreResult<()> {
        let all = self.unlock_all_raw(true);
        let tx = self.unlock_offset(TRANSACTION_LOCK);
        all.and(tx)
    }

    /// Writes the commit journal without committing.
    ///
    /// After this succeeds, [`transaction_commit`](Self::transaction_commit)
    /// only has to flip the header, so it can be used as the first phase of
    /// a commit coordinated with other resources. Failure cancels the
    /// transaction.
    pub fn transaction_prepare_commit(&mut self) -> CoreResult<()> {
        let result = self.prepare_outer();
        self.track(result)
    }

    fn prepare_outer(&mut self) -> CoreResult<()> {
        self.ensure_usable()?;
        self.ensure_committable()?;
        let Some(tx) = &self.transaction else {
            return Err(CoreError::invalid_argument("no transaction is active"));
        };
        if tx.nesting > 0 {
            return Err(CoreError::invalid_argument("cannot prepare a nested transaction"));
        }
        if tx.prepared.is_some() {
            return Err(CoreError::invalid_argument("transaction is already prepared"));
        }
        self.abort_if_poisoned()?;
        let prepared = self.prepare_or_cancel()?;
        if let Some(tx) = &mut self.transaction {
            tx.prepared = Some(prepared);
        }
        Ok(())
    }

    /// Commits the active transaction.
    ///
    /// Inside a nested transaction this only closes the inner level.
    ///
    /// # Errors
    ///
    /// - `TransactionAborted` if a nested level was cancelled; the whole
    ///   transaction is then cancelled
    /// - any I/O error; before the commit point the transaction is
    ///   cancelled, after it the handle is disabled and the next opener
    ///   finishes the commit
    pub fn transaction_commit(&mut self) -> CoreResult<()> {
        let result = self.commit_outer();
        self.track(result)
    }

    fn commit_outer(&mut self) -> CoreResult<()> {
        self.ensure_usable()?;
        let Some(tx) = &mut self.transaction else {
            return Err(CoreError::invalid_argument("no transaction is active"));
        };
        if tx.nesting > 0 {
            tx.nesting -= 1;
            return Ok(());
        }
        self.ensure_committable()?;
        self.abort_if_poisoned()?;

        let prepared = match self.transaction.as_ref().and_then(|tx| tx.prepared) {
            Some(prepared) => prepared,
            None => self.prepare_or_cancel()?,
        };
        if let Err(err) = self.finish_commit(prepared) {
            self.disable(&err);
            if let Err(release) = self.release_transaction_locks() {
                warn!(name = %self.name(), error = %release, "releasing transaction locks failed");
            }
            return Err(err);
        }
        self.stats.record_transaction_commit();
        Ok(())
    }

    fn ensure_committable(&self) -> CoreResult<()> {
        if self.traverse_depth > 0 || self.traverse_read_depth > 0 {
            return Err(CoreError::invalid_argument(
                "cannot commit from inside a traversal",
            ));
        }
        Ok(())
    }

    fn abort_if_poisoned(&mut self) -> CoreResult<()> {
        let Some(reason) = self.transaction.as_ref().and_then(|tx| tx.poisoned.clone()) else {
            return Ok(());
        };
        self.stats.record_transaction_cancel();
        self.abandon_transaction()?;
        Err(CoreError::transaction_aborted(reason))
    }

    fn prepare_or_cancel(&mut self) -> CoreResult<Prepared> {
        match self.prepare() {
            Ok(prepared) => Ok(prepared),
            Err(err) => {
                self.log.log(
                    LogLevel::Error,
                    err.kind(),
                    &format!("transaction commit failed, cancelling: {err}"),
                );
                self.stats.record_transaction_cancel();
                if let Err(cancel) = self.abandon_transaction() {
                    warn!(name = %self.name(), error = %cancel, "cleanup after failed commit failed");
                }
                Err(err)
            }
        }
    }

    /// Everything up to the commit point. Leaves the file's committed
    /// image untouched.
    fn prepare(&mut self) -> CoreResult<Prepared> {
        self.upgrade_all_raw()?;

        let sequence = self.read_u64(field::SEQUENCE)?;
        self.write_u64(field::SEQUENCE, sequence.wrapping_add(1))?;

        let view_size = self.view_size()?;
        let journal_offset = align_up(self.io.size()?.max(view_size), ALIGNMENT)?;
        self.write_u64(field::RECOVERY, journal_offset)?;
        let data_end = self.data_end()?;

        let Some(tx) = &self.transaction else {
            return Err(CoreError::invalid_argument("no transaction is active"));
        };
        tx.verify(&*self.io)?;
        let bytes = tx.journal(data_end).encode();
        let dirty = tx.dirty_pages();

        self.io.grow(journal_offset + bytes.len() as u64)?;
        self.io.write_at(journal_offset, &bytes)?;
        self.sync_file()?;

        debug!(
            name = %self.name(),
            journal = journal_offset,
            bytes = bytes.len(),
            pages = dirty,
            "commit journal written"
        );
        Ok(Prepared {
            journal_offset,
            data_end,
        })
    }

    /// From the commit point on.
    fn finish_commit(&mut self, prepared: Prepared) -> CoreResult<()> {
        let Some(tx) = self.transaction.take() else {
            return Err(CoreError::invalid_argument("no transaction is active"));
        };
        let journal = tx.journal(prepared.data_end);

        self.io
            .write_at(field::RECOVERY, &prepared.journal_offset.to_le_bytes())?;
        self.sync_file()?;

        self.apply(&journal)?;
        self.release_transaction_locks()?;
        debug!(name = %self.name(), entries = journal.entries.len(), "transaction committed");
        Ok(())
    }

    /// Writes a journal's entries, then clears the recovery pointer and
    /// drops the scratch area.
    fn apply(&mut self, journal: &Journal) -> CoreResult<()> {
        for entry in &journal.entries {
            self.io.write_at(entry.offset, &entry.bytes)?;
        }
        self.sync_file()?;
        self.io.write_at(field::RECOVERY, &0u64.to_le_bytes())?;
        self.sync_file()?;
        self.io.truncate(journal.data_end)?;
        Ok(())
    }

    /// Cancels the active transaction.
    ///
    /// Inside a nested transaction this closes the inner level and dooms
    /// the outer one: its commit will fail with `TransactionAborted`.
    pub fn transaction_cancel(&mut self) -> CoreResult<()> {
        let result = self.cancel_outer();
        self.track(result)
    }

    fn cancel_outer(&mut self) -> CoreResult<()> {
        let Some(tx) = &mut self.transaction else {
            return Err(CoreError::invalid_argument("no transaction is active"));
        };
        if tx.nesting > 0 {
            tx.nesting -= 1;
            tx.poisoned = Some("a nested transaction was cancelled".to_string());
            return Ok(());
        }
        self.stats.record_transaction_cancel();
        self.abandon_transaction()?;
        debug!(name = %self.name(), "transaction cancelled");
        Ok(())
    }

    /// Drops the overlay and the locks. The file is left as it was at
    /// start, apart from scratch space past the data.
    pub(crate) fn abandon_transaction(&mut self) -> CoreResult<()> {
        let Some(tx) = self.transaction.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        if self.io.size().is_ok_and(|size| size > tx.base_size()) {
            result = self.io.truncate(tx.base_size()).map_err(CoreError::from);
        }
        let released = self.release_transaction_locks();
        result.and(released)
    }

    /// Replays the commit journal the header points at, if any.
    ///
    /// The caller holds the transaction lock and the all-record lock for
    /// writing. Returns true if a journal was replayed.
    pub(crate) fn recover(&mut self) -> CoreResult<bool> {
        let journal_offset = get_u64(&self.io.read_at(field::RECOVERY, 8)?, 0);
        if journal_offset == 0 {
            return Ok(false);
        }
        if self.read_only {
            return Err(CoreError::ReadOnly);
        }
        let journal = match self.read_journal(journal_offset) {
            Ok(journal) => journal,
            Err(err) => {
                let err = CoreError::corrupt(format!(
                    "cannot replay commit journal at offset {journal_offset}: {err}"
                ));
                self.log.log(LogLevel::Error, ErrorKind::Corrupt, &err.to_string());
                return Err(err);
            }
        };
        self.apply(&journal)?;
        self.stats.record_recovery();
        info!(
            name = %self.name(),
            journal = journal_offset,
            entries = journal.entries.len(),
            "replayed interrupted commit"
        );
        Ok(true)
    }

    fn read_journal(&self, offset: u64) -> CoreResult<Journal> {
        let data_end = get_u64(&self.io.read_at(field::DATA_END, 8)?, 0);
        let file_size = self.io.size()?;
        if offset < data_end || offset % ALIGNMENT != 0 {
            return Err(CoreError::corrupt("journal offset lies inside the data area"));
        }
        let fits = |len: u64| offset.checked_add(len).is_some_and(|end| end <= file_size);
        if !fits(JOURNAL_HEADER_SIZE) {
            return Err(CoreError::corrupt("journal lies past the end of the file"));
        }
        let header = self.io.read_at(offset, JOURNAL_HEADER_SIZE as usize)?;
        let len = Journal::body_len(&header)?
            .checked_add(journal_len(0))
            .filter(|&len| fits(len))
            .ok_or_else(|| CoreError::corrupt("journal lies past the end of the file"))?;
        let journal = Journal::decode(&self.io.read_at(offset, len as usize)?)?;

        if journal.data_end > offset
            || journal.data_end < data_end
            || journal.data_end % ALIGNMENT != 0
        {
            return Err(CoreError::corrupt(format!(
                "journal data end {} is out of range",
                journal.data_end
            )));
        }
        for entry in &journal.entries {
            let in_range = entry
                .offset
                .checked_add(entry.bytes.len() as u64)
                .is_some_and(|end| end <= journal.data_end);
            if !in_range {
                return Err(CoreError::corrupt(format!(
                    "journal entry at offset {} is out of range",
                    entry.offset
                )));
            }
        }
        Ok(journal)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, CoreError, Database, ErrorKind, StoreMode};
    use tempfile::tempdir;

    fn db() -> Database {
        Database::open_in_memory(&Config::new().hash_table_size_hint(5)).unwrap()
    }

    #[test]
    fn reads_see_own_writes() {
        let mut db = db();
        db.store(b"k", b"old", StoreMode::Insert).unwrap();
        db.transaction_start().unwrap();
        db.store(b"k", b"new", StoreMode::Replace).unwrap();
        db.store(b"other", b"x", StoreMode::Insert).unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), b"new");
        assert!(db.exists(b"other").unwrap());
        db.transaction_commit().unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), b"new");
        db.check().unwrap();
    }

    #[test]
    fn cancel_leaves_file_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.htdb");
        let mut db = Database::open(&path, &Config::default()).unwrap();
        db.store(b"keep", b"me", StoreMode::Insert).unwrap();
        let before = std::fs::read(&path).unwrap();

        db.transaction_start().unwrap();
        for i in 0..200u32 {
            db.store(&i.to_le_bytes(), &[7u8; 300], StoreMode::Either).unwrap();
        }
        db.delete(b"keep").unwrap();
        db.transaction_cancel().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(db.fetch(b"keep").unwrap(), b"me");
        assert_eq!(db.stats().transactions_cancelled, 1);
    }

    #[test]
    fn commit_leaves_no_scratch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.htdb");
        let mut db = Database::open(&path, &Config::default()).unwrap();
        db.transaction(|db| db.store(b"a", &[1u8; 5000], StoreMode::Insert))
            .unwrap();
        let data_end = db.data_end().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), data_end);
        assert_eq!(db.sequence_number().unwrap(), 1);
    }

    #[test]
    fn closure_error_cancels() {
        let mut db = db();
        let err = db
            .transaction(|db| {
                db.store(b"a", b"1", StoreMode::Insert)?;
                db.store(b"a", b"2", StoreMode::Insert)
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists));
        assert!(!db.transaction_active());
        assert!(matches!(db.fetch(b"a"), Err(CoreError::NoSuchKey)));
    }

    #[test]
    fn nesting_needs_opt_in() {
        let mut db = db();
        db.transaction_start().unwrap();
        let err = db.transaction_start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        db.transaction_cancel().unwrap();
    }

    #[test]
    fn nested_cancel_dooms_outer_commit() {
        let mut db = Database::open_in_memory(&Config::new().allow_nesting(true)).unwrap();
        db.transaction_start().unwrap();
        db.store(b"a", b"1", StoreMode::Insert).unwrap();
        db.transaction_start().unwrap();
        db.store(b"b", b"2", StoreMode::Insert).unwrap();
        db.transaction_cancel().unwrap();

        let err = db.transaction_commit().unwrap_err();
        assert!(matches!(err, CoreError::TransactionAborted { .. }));
        assert!(!db.transaction_active());
        assert!(!db.exists(b"a").unwrap());
    }

    #[test]
    fn nested_commit_is_deferred() {
        let mut db = Database::open_in_memory(&Config::new().allow_nesting(true)).unwrap();
        db.transaction_start().unwrap();
        db.transaction_start().unwrap();
        db.store(b"a", b"1", StoreMode::Insert).unwrap();
        db.transaction_commit().unwrap();
        assert!(db.transaction_active());
        db.transaction_commit().unwrap();
        assert!(!db.transaction_active());
        assert_eq!(db.fetch(b"a").unwrap(), b"1");
    }

    #[test]
    fn prepared_commit_then_commit() {
        let mut db = db();
        db.transaction_start().unwrap();
        db.store(b"a", b"1", StoreMode::Insert).unwrap();
        db.transaction_prepare_commit().unwrap();
        assert!(db.transaction_prepare_commit().is_err());
        db.transaction_commit().unwrap();
        assert_eq!(db.fetch(b"a").unwrap(), b"1");
        db.check().unwrap();
    }

    #[test]
    fn prepared_commit_can_be_cancelled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.htdb");
        let mut db = Database::open(&path, &Config::default()).unwrap();
        let before = std::fs::read(&path).unwrap();
        db.transaction_start().unwrap();
        db.store(b"a", b"1", StoreMode::Insert).unwrap();
        db.transaction_prepare_commit().unwrap();
        db.transaction_cancel().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn commit_without_transaction_is_invalid() {
        let mut db = db();
        let err = db.transaction_commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(db.last_error(), Some(ErrorKind::InvalidArgument));
    }

    #[test]
    fn start_while_holding_chain_lock_fails() {
        let mut db = db();
        db.chain_lock(b"k").unwrap();
        let err = db.transaction_start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lock);
        db.chain_unlock(b"k").unwrap();
        db.transaction_start().unwrap();
        db.transaction_cancel().unwrap();
    }

    #[test]
    fn interrupted_commit_is_replayed_at_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.htdb");
        let mut db = Database::open(&path, &Config::default()).unwrap();
        db.store(b"a", b"before", StoreMode::Insert).unwrap();
        db.transaction_start().unwrap();
        db.store(b"a", b"after", StoreMode::Replace).unwrap();
        db.store(b"b", b"new", StoreMode::Insert).unwrap();
        db.transaction_prepare_commit().unwrap();

        // Flip the header to the journal by hand: the state a crash right
        // after the commit point leaves behind.
        let journal = db
            .transaction
            .as_ref()
            .and_then(|tx| tx.prepared)
            .unwrap()
            .journal_offset;
        db.io
            .write_at(crate::layout::field::RECOVERY, &journal.to_le_bytes())
            .unwrap();
        let image = std::fs::read(&path).unwrap();
        drop(db);
        std::fs::write(&path, image).unwrap();

        let mut db = Database::open(&path, &Config::default()).unwrap();
        assert_eq!(db.stats().recoveries, 1);
        assert_eq!(db.fetch(b"a").unwrap(), b"after");
        assert_eq!(db.fetch(b"b").unwrap(), b"new");
        db.check().unwrap();
    }
}
