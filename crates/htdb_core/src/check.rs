//! Integrity checker.
//!
//! The check walks the data area block by block, then every chain and every
//! free list, and cross-checks the two views: each record must be reached
//! from exactly one chain (its own bucket) and each free block from exactly
//! one free list (its own size class).
//!
//! A single flipped bit anywhere in these bytes is caught:
//! - the first 80 header bytes
//! - the free-list and chain roots
//! - every live record's header, key, value and tailer (the value only
//!   through a validator that knows the stored pairs)
//! - every free block's magic, `next`, length and tailer
//!
//! Padding, the stale fields of free blocks, the header's sequence number
//! and anything past the data end are not checked.

use crate::database::Database;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::layout::{
    bucket_offset, field, free_root_offset, get_u32, get_u64, size_class, BlockHeader,
    ALIGNMENT, BLOCK_HEADER_SIZE, BUCKET_TOP, FORMAT_VERSION, FREELIST_TOP, FREE_CLASSES,
    HEADER_VERIFIABLE_BYTES, MAGIC, MIN_BLOCK_SIZE, TAILER_SIZE,
};
use crate::log::LogLevel;
use htdb_storage::LockKind;
use std::collections::{BTreeMap, HashSet};

/// What a linear walk found at one offset.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Block {
    pub(crate) header: BlockHeader,
    pub(crate) total: u64,
}

impl Database {
    /// Checks the structure of the whole file.
    ///
    /// # Errors
    ///
    /// `Corrupt` describing the first problem found. Corruption is logged.
    pub fn check(&mut self) -> CoreResult<()> {
        self.check_with(|_, _| true)
    }

    /// Checks the structure of the whole file and hands every record to
    /// `validate`; a record it rejects counts as corruption.
    ///
    /// # Example
    ///
    /// ```rust
    /// use htdb_core::{Config, Database, StoreMode};
    ///
    /// let mut db = Database::open_in_memory(&Config::default())?;
    /// db.store(b"count", b"3", StoreMode::Insert)?;
    /// db.check_with(|_, value| value.iter().all(u8::is_ascii_digit))?;
    /// # Ok::<(), htdb_core::CoreError>(())
    /// ```
    pub fn check_with<F>(&mut self, mut validate: F) -> CoreResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let result = self.ensure_usable().and_then(|()| {
            self.lock_all_checked(LockKind::Read)?;
            let checked = self.check_locked(&mut validate);
            if let Err(err) = &checked {
                if err.kind() == ErrorKind::Corrupt {
                    self.log.log(
                        LogLevel::Error,
                        ErrorKind::Corrupt,
                        &format!("integrity check failed: {err}"),
                    );
                }
            }
            let unlocked = self.unlock_all_raw(false);
            checked.and(unlocked)
        });
        self.track(result)
    }

    fn check_locked(&mut self, validate: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> CoreResult<()> {
        let data_end = self.check_header()?;
        let blocks = self.walk_blocks(data_end)?;
        let mut reached = HashSet::new();

        for bucket in 0..self.header.hash_size {
            let mut current = self.read_u64(bucket_offset(bucket))?;
            while current != 0 {
                let block = reached_block(&blocks, &mut reached, current)?;
                if !block.header.is_record() {
                    return Err(CoreError::corrupt(format!(
                        "chain {bucket} reaches free block at offset {current}"
                    )));
                }
                self.check_record(bucket, current, &block.header, validate)?;
                current = block.header.next;
            }
        }

        for class in 0..FREE_CLASSES {
            let mut current = self.read_u64(free_root_offset(class))?;
            while current != 0 {
                let block = reached_block(&blocks, &mut reached, current)?;
                if !block.header.is_free() {
                    return Err(CoreError::corrupt(format!(
                        "free list {class} reaches record at offset {current}"
                    )));
                }
                if size_class(block.total) != class {
                    return Err(CoreError::corrupt(format!(
                        "free block at offset {current} of {} bytes is on free list {class}",
                        block.total
                    )));
                }
                current = block.header.next;
            }
        }

        if let Some(offset) = blocks.keys().find(|offset| !reached.contains(*offset)) {
            return Err(CoreError::corrupt(format!(
                "block at offset {offset} is on no chain or free list"
            )));
        }
        Ok(())
    }

    /// Verifies the header against what was read at open and returns the
    /// data end.
    fn check_header(&self) -> CoreResult<u64> {
        let buf = self.read(0, HEADER_VERIFIABLE_BYTES as usize)?;
        let expected = &self.header;
        if buf[..MAGIC.len()] != MAGIC {
            return Err(CoreError::corrupt("header magic damaged"));
        }
        let fixed = [
            ("version", u64::from(get_u32(&buf, field::VERSION)), u64::from(FORMAT_VERSION)),
            ("hash size", u64::from(get_u32(&buf, field::HASH_SIZE)), u64::from(expected.hash_size)),
            ("hash family", u64::from(get_u32(&buf, field::HASH_FAMILY)), u64::from(expected.hash_family)),
            ("flags", u64::from(get_u32(&buf, field::FLAGS)), 0),
            ("hash seed", get_u64(&buf, field::HASH_SEED), expected.hash_seed),
            ("hash check", get_u64(&buf, field::HASH_CHECK), expected.hash_check),
            ("free-list offset", get_u64(&buf, field::FREELIST_TOP), FREELIST_TOP),
            ("chain offset", get_u64(&buf, field::BUCKET_TOP), BUCKET_TOP),
        ];
        for (name, found, wanted) in fixed {
            if found != wanted {
                return Err(CoreError::corrupt(format!(
                    "header {name} is {found:#x}, expected {wanted:#x}"
                )));
            }
        }

        let recovery = get_u64(&buf, field::RECOVERY);
        if recovery != 0 && self.transaction.is_none() {
            return Err(CoreError::corrupt(format!(
                "header points at a commit journal ({recovery:#x}) that was not replayed"
            )));
        }

        let data_end = get_u64(&buf, field::DATA_END);
        if data_end < self.header.data_start()
            || data_end % ALIGNMENT != 0
            || data_end > self.view_size()?
        {
            return Err(CoreError::corrupt(format!("data end {data_end:#x} out of range")));
        }
        Ok(data_end)
    }

    /// Walks the tiled data area from start to `data_end`.
    pub(crate) fn walk_blocks(&self, data_end: u64) -> CoreResult<BTreeMap<u64, Block>> {
        let mut blocks = BTreeMap::new();
        let mut offset = self.header.data_start();
        while offset < data_end {
            if data_end - offset < MIN_BLOCK_SIZE {
                return Err(CoreError::corrupt(format!(
                    "{} stray bytes at the end of the data area",
                    data_end - offset
                )));
            }
            let header = self.read_block(offset)?;
            if !header.is_record() && !header.is_free() {
                return Err(CoreError::corrupt(format!(
                    "bad block magic {:#x} at offset {offset}",
                    header.magic
                )));
            }
            let total = header
                .total()
                .filter(|&total| total >= MIN_BLOCK_SIZE && total % ALIGNMENT == 0)
                .filter(|&total| total <= data_end - offset)
                .ok_or_else(|| {
                    CoreError::corrupt(format!(
                        "block at offset {offset} has bad length {}",
                        header.rec_len
                    ))
                })?;
            let tailer = self.read_u64(offset + total - TAILER_SIZE)?;
            if tailer != total {
                return Err(CoreError::corrupt(format!(
                    "block at offset {offset} has tailer {tailer}, expected {total}"
                )));
            }
            if header.is_record() && header.used().is_none_or(|used| used > header.rec_len) {
                return Err(CoreError::corrupt(format!(
                    "record at offset {offset} does not fit its block"
                )));
            }
            blocks.insert(offset, Block { header, total });
            offset += total;
        }
        Ok(blocks)
    }

    fn check_record(
        &self,
        bucket: u32,
        offset: u64,
        header: &BlockHeader,
        validate: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> CoreResult<()> {
        let key = self.read(offset + BLOCK_HEADER_SIZE, header.key_len as usize)?;
        let hash = self.key_hash(&key);
        if hash != header.full_hash {
            return Err(CoreError::corrupt(format!(
                "record at offset {offset} has a stored hash that does not match its key"
            )));
        }
        if self.bucket_for_hash(hash) != bucket {
            return Err(CoreError::corrupt(format!(
                "record at offset {offset} is on chain {bucket}, not its own"
            )));
        }
        let value_len = usize::try_from(header.data_len)
            .map_err(|_| CoreError::corrupt("record value does not fit in memory"))?;
        let value = self.read(offset + BLOCK_HEADER_SIZE + key.len() as u64, value_len)?;
        if !validate(&key, &value) {
            return Err(CoreError::corrupt(format!(
                "validator rejected record at offset {offset}"
            )));
        }
        Ok(())
    }
}

/// Looks up a chain or free-list target, refusing anything reached twice.
fn reached_block(
    blocks: &BTreeMap<u64, Block>,
    reached: &mut HashSet<u64>,
    offset: u64,
) -> CoreResult<Block> {
    let block = blocks.get(&offset).ok_or_else(|| {
        CoreError::corrupt(format!("list points at offset {offset}, not a block start"))
    })?;
    if !reached.insert(offset) {
        return Err(CoreError::corrupt(format!(
            "block at offset {offset} is reached twice"
        )));
    }
    Ok(*block)
}

#[cfg(test)]
mod tests {
    use crate::layout::{block, bucket_offset, free_root_offset};
    use crate::{Config, Database, ErrorKind, LogLevel, StoreMode};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn db_with_log() -> (Database, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let config = Config::new()
            .hash_table_size_hint(2)
            .log_sink(Arc::new(move |_: LogLevel, _: ErrorKind, msg: &str| {
                sink_seen.lock().push(msg.to_string());
            }));
        let mut db = Database::open_in_memory(&config).unwrap();
        for key in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            db.store(key.as_bytes(), b"value", StoreMode::Insert).unwrap();
        }
        db.delete(b"gamma").unwrap();
        (db, seen)
    }

    #[test]
    fn healthy_file_passes() {
        let (mut db, seen) = db_with_log();
        db.check().unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn validator_rejection_is_corruption() {
        let (mut db, seen) = db_with_log();
        let err = db.check_with(|key, _| key != b"beta").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(db.last_error(), Some(ErrorKind::Corrupt));
        db.check().unwrap();
    }

    #[test]
    fn damaged_key_is_found() {
        let (mut db, _) = db_with_log();
        let offset = db.record_offset(b"alpha").unwrap();
        db.write(offset + 40, b"A").unwrap();
        assert_eq!(db.check().unwrap_err().kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn dangling_root_is_found() {
        let (mut db, _) = db_with_log();
        let offset = db.record_offset(b"alpha").unwrap();
        let bucket = db.bucket_of(b"alpha");
        db.write_u64(bucket_offset(bucket), offset + 8).unwrap();
        assert_eq!(db.check().unwrap_err().kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn orphaned_free_block_is_found() {
        let (mut db, _) = db_with_log();
        for class in 0..8 {
            db.write_u64(free_root_offset(class), 0).unwrap();
        }
        assert_eq!(db.check().unwrap_err().kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn stale_free_fields_are_ignored() {
        let (mut db, _) = db_with_log();
        let start = db.header.data_start();
        let free = db.read_block(start).unwrap();
        assert!(free.is_free());
        db.write_u64(start + block::FULL_HASH, 0xdead_beef).unwrap();
        db.write_u32(start + block::KEY_LEN, 77).unwrap();
        db.check().unwrap();
    }

    #[test]
    fn check_works_inside_a_transaction() {
        let (mut db, _) = db_with_log();
        db.transaction_start().unwrap();
        db.store(b"zeta", b"new", StoreMode::Insert).unwrap();
        db.check().unwrap();
        db.transaction_commit().unwrap();
        db.check().unwrap();
    }
}
