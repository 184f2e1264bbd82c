//! Record operations: store, fetch, delete, append and friends.

use crate::chain::Found;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::layout::{
    block, bucket_offset, field, free_root_offset, record_total, size_class, BlockHeader,
    BLOCK_HEADER_SIZE, FREE_CLASSES, FREELIST_TOP, MIN_BLOCK_SIZE, RECORD_MAGIC,
    TAILER_SIZE,
};
use htdb_storage::LockKind;

/// How [`Database::store`] treats a key that is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Fail with `AlreadyExists` if the key is present.
    Insert,
    /// Fail with `NoSuchKey` if the key is absent.
    Replace,
    /// Insert or replace.
    #[default]
    Either,
}

fn key_len(key: &[u8]) -> CoreResult<u32> {
    u32::try_from(key.len())
        .map_err(|_| CoreError::invalid_argument(format!("key of {} bytes is too long", key.len())))
}

impl Database {
    /// Runs `op` with the bucket of `key` locked.
    fn with_bucket<T>(
        &mut self,
        key: &[u8],
        kind: LockKind,
        op: impl FnOnce(&mut Self, u32, u64) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let hash = self.key_hash(key);
        let bucket = self.bucket_for_hash(hash);
        self.lock_bucket(bucket, kind)?;
        let result = op(self, bucket, hash);
        let unlocked = self.unlock_bucket(bucket);
        result.and_then(|value| unlocked.map(|()| value))
    }

    /// Runs a modifying operation and applies the write-failure policy.
    fn modify<T>(
        &mut self,
        key: &[u8],
        op: impl FnOnce(&mut Self, u32, u64) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let result = self
            .ensure_writable()
            .and_then(|()| key_len(key))
            .and_then(|_| self.with_bucket(key, LockKind::Write, op));
        if let Err(err) = &result {
            self.note_write_failure(err);
        }
        self.track(result)
    }

    /// Stores `value` under `key`.
    ///
    /// A value that fits the record's existing block is overwritten in
    /// place; otherwise the record moves to a new block.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` for [`StoreMode::Insert`] on a present key
    /// - `NoSuchKey` for [`StoreMode::Replace`] on an absent key
    /// - `ReadOnly` on a read-only handle or inside a read traversal
    pub fn store(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> CoreResult<()> {
        self.modify(key, |db, bucket, hash| {
            db.store_locked(bucket, key, hash, value, mode)
        })?;
        self.stats.record_store(value.len() as u64);
        Ok(())
    }

    fn store_locked(
        &mut self,
        bucket: u32,
        key: &[u8],
        hash: u64,
        value: &[u8],
        mode: StoreMode,
    ) -> CoreResult<()> {
        let found = self.find(bucket, key, hash)?;
        match (mode, &found) {
            (StoreMode::Insert, Some(_)) => return Err(CoreError::AlreadyExists),
            (StoreMode::Replace, None) => return Err(CoreError::NoSuchKey),
            _ => {}
        }

        if let Some(found) = &found {
            let needed = (key.len() as u64)
                .checked_add(value.len() as u64)
                .and_then(|n| n.checked_add(TAILER_SIZE));
            if needed.is_some_and(|needed| needed <= found.header.rec_len) {
                return self.rewrite_value(found, &[value]);
            }
        }

        self.with_alloc_lock(|db| {
            if let Some(found) = &found {
                db.unlink(found)?;
                db.free_block(found.offset, found.total())?;
            }
            db.insert_record(bucket, key, hash, &[value])?;
            db.note_modification()
        })
    }

    /// Overwrites a record's value inside its block. The value is written
    /// as `parts` concatenated.
    fn rewrite_value(&mut self, found: &Found, parts: &[&[u8]]) -> CoreResult<()> {
        let mut at = found.value_offset();
        for part in parts {
            self.write(at, part)?;
            at += part.len() as u64;
        }
        let data_len = at - found.value_offset();
        self.write_u64(found.offset + block::DATA_LEN, data_len)?;
        if self.sequence_tracking {
            self.with_alloc_lock(Self::note_modification)?;
        }
        Ok(())
    }

    /// Writes a new record and links it at the head of `bucket`. The value
    /// is written as `parts` concatenated.
    fn insert_record(
        &mut self,
        bucket: u32,
        key: &[u8],
        hash: u64,
        parts: &[&[u8]],
    ) -> CoreResult<u64> {
        let data_len: usize = parts.iter().map(|part| part.len()).sum();
        let total = record_total(key.len(), data_len)?;
        let (offset, rec_len) = self.allocate(total)?;
        let header = BlockHeader {
            magic: RECORD_MAGIC,
            key_len: key_len(key)?,
            data_len: data_len as u64,
            full_hash: hash,
            next: self.read_u64(bucket_offset(bucket))?,
            rec_len,
        };

        self.write_block(offset, &header)?;
        let mut at = offset + BLOCK_HEADER_SIZE;
        self.write(at, key)?;
        at += key.len() as u64;
        for part in parts {
            self.write(at, part)?;
            at += part.len() as u64;
        }
        let tailer = offset + BLOCK_HEADER_SIZE + rec_len - TAILER_SIZE;
        self.write_u64(tailer, rec_len + BLOCK_HEADER_SIZE)?;
        self.link_head(bucket, offset)?;
        Ok(offset)
    }

    /// Bumps the sequence number if tracking is on. Runs under the
    /// allocator lock.
    fn note_modification(&mut self) -> CoreResult<()> {
        if self.sequence_tracking {
            self.bump_sequence()?;
        }
        Ok(())
    }

    pub(crate) fn bump_sequence(&mut self) -> CoreResult<()> {
        let sequence = self.read_u64(field::SEQUENCE)?;
        self.write_u64(field::SEQUENCE, sequence.wrapping_add(1))
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// `NoSuchKey` if the key is absent.
    pub fn fetch(&mut self, key: &[u8]) -> CoreResult<Vec<u8>> {
        let result = self.ensure_usable().and_then(|()| {
            self.with_bucket(key, LockKind::Read, |db, bucket, hash| {
                let found = db.find(bucket, key, hash)?.ok_or(CoreError::NoSuchKey)?;
                db.read_value(&found)
            })
        });
        if let Ok(value) = &result {
            self.stats.record_fetch(value.len() as u64);
        }
        self.track(result)
    }

    pub(crate) fn read_value(&self, found: &Found) -> CoreResult<Vec<u8>> {
        let len = usize::try_from(found.header.data_len)
            .map_err(|_| CoreError::corrupt("record value does not fit in memory"))?;
        self.read(found.value_offset(), len)
    }

    /// Returns true if `key` is present.
    pub fn exists(&mut self, key: &[u8]) -> CoreResult<bool> {
        let result = self.ensure_usable().and_then(|()| {
            self.with_bucket(key, LockKind::Read, |db, bucket, hash| {
                Ok(db.find(bucket, key, hash)?.is_some())
            })
        });
        self.track(result)
    }

    /// Removes `key` and returns its block to the free lists.
    ///
    /// # Errors
    ///
    /// `NoSuchKey` if the key is absent.
    pub fn delete(&mut self, key: &[u8]) -> CoreResult<()> {
        self.modify(key, |db, bucket, hash| {
            let found = db.find(bucket, key, hash)?.ok_or(CoreError::NoSuchKey)?;
            db.unlink(&found)?;
            db.with_alloc_lock(|db| {
                db.free_block(found.offset, found.total())?;
                db.note_modification()
            })
        })?;
        self.stats.record_delete();
        Ok(())
    }

    /// Appends `data` to the value of `key`, creating the key if absent.
    pub fn append(&mut self, key: &[u8], data: &[u8]) -> CoreResult<()> {
        self.modify(key, |db, bucket, hash| {
            let Some(found) = db.find(bucket, key, hash)? else {
                return db.with_alloc_lock(|db| {
                    db.insert_record(bucket, key, hash, &[data])?;
                    db.note_modification()
                });
            };
            let old = db.read_value(&found)?;
            let needed = found
                .header
                .used()
                .and_then(|used| used.checked_add(data.len() as u64));
            if needed.is_some_and(|needed| needed <= found.header.rec_len) {
                return db.rewrite_value(&found, &[&old, data]);
            }
            db.with_alloc_lock(|db| {
                db.unlink(&found)?;
                db.free_block(found.offset, found.total())?;
                db.insert_record(bucket, key, hash, &[&old, data])?;
                db.note_modification()
            })
        })?;
        self.stats.record_store(data.len() as u64);
        Ok(())
    }

    /// Returns the file offset of the record holding `key`.
    ///
    /// Diagnostic; the offset is only stable until the next modification.
    pub fn record_offset(&mut self, key: &[u8]) -> CoreResult<u64> {
        let result = self.ensure_usable().and_then(|()| {
            self.with_bucket(key, LockKind::Read, |db, bucket, hash| {
                let found = db.find(bucket, key, hash)?.ok_or(CoreError::NoSuchKey)?;
                Ok(found.offset)
            })
        });
        self.track(result)
    }

    /// Returns the file's sequence number.
    ///
    /// Every commit bumps it; with sequence tracking on, so does every
    /// modification.
    pub fn sequence_number(&mut self) -> CoreResult<u64> {
        let result = self.ensure_usable().and_then(|()| self.read_u64(field::SEQUENCE));
        self.track(result)
    }

    /// Bumps the sequence number on every modification from now on.
    pub fn enable_sequence_tracking(&mut self) {
        self.sequence_tracking = true;
    }

    /// Deletes every record, leaving the whole data area as one free block.
    pub fn wipe_all(&mut self) -> CoreResult<()> {
        let result = self.ensure_writable().and_then(|()| {
            if self.transaction.is_some() {
                return self.wipe_locked();
            }
            self.lock_all_checked(LockKind::Write)?;
            let wiped = self.wipe_locked();
            let unlocked = self.unlock_all_raw(false);
            wiped.and(unlocked)
        });
        if let Err(err) = &result {
            self.note_write_failure(err);
        }
        self.track(result)
    }

    /// Runs under the all-record write lock or in a transaction.
    pub(crate) fn wipe_locked(&mut self) -> CoreResult<()> {
        // The free-list roots and the chain roots are contiguous.
        let roots = (FREE_CLASSES + u64::from(self.header.hash_size)) as usize * 8;
        self.write(FREELIST_TOP, &vec![0u8; roots])?;

        let data_start = self.header.data_start();
        let data_end = self.data_end()?;
        if data_end >= data_start + MIN_BLOCK_SIZE {
            let total = data_end - data_start;
            self.write_block(data_start, &BlockHeader::free(total - BLOCK_HEADER_SIZE))?;
            self.write_u64(data_end - TAILER_SIZE, total)?;
            self.write_u64(free_root_offset(size_class(total)), data_start)?;
        }
        self.generation += 1;
        self.note_modification()
    }

    /// Rewrites every record into a fresh data area, in one transaction,
    /// merging all free space into one block.
    pub fn repack(&mut self) -> CoreResult<()> {
        if let Err(err) = self.ensure_writable() {
            return self.track(Err(err));
        }
        if self.transaction.is_some() {
            let result = self.repack_locked();
            return self.track(result);
        }
        self.transaction(Self::repack_locked)
    }

    fn repack_locked(&mut self) -> CoreResult<()> {
        let mut records = Vec::new();
        for bucket in 0..self.header.hash_size {
            for (offset, _) in self.chain_members(bucket)? {
                let header = self.read_block(offset)?;
                let key = self.read(offset + BLOCK_HEADER_SIZE, header.key_len as usize)?;
                let found = Found {
                    offset,
                    link: 0,
                    header,
                };
                records.push((bucket, key, header.full_hash, self.read_value(&found)?));
            }
        }
        self.wipe_locked()?;
        for (bucket, key, hash, value) in records.iter().rev() {
            self.insert_record(*bucket, key, *hash, &[value])?;
        }
        Ok(())
    }
}
