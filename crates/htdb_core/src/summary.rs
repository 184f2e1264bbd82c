//! Space usage summary.

use crate::database::Database;
use crate::error::CoreResult;
use crate::layout::{BLOCK_HEADER_SIZE, TAILER_SIZE};
use htdb_storage::LockKind;
use std::fmt;

/// How the file's space is used, as reported by [`Database::summary`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    /// Physical size of the file.
    pub file_size: u64,
    /// End of the data area.
    pub data_end: u64,
    /// Number of hash buckets.
    pub hash_size: u32,
    /// Live records.
    pub records: u64,
    /// Free blocks.
    pub free_blocks: u64,
    /// Bytes of keys.
    pub key_bytes: u64,
    /// Bytes of values.
    pub data_bytes: u64,
    /// Bytes held by free blocks, headers included.
    pub free_bytes: u64,
    /// Unused bytes inside records.
    pub padding_bytes: u64,
    /// Block headers and tailers of live records.
    pub overhead_bytes: u64,
    /// Largest free block.
    pub largest_free: u64,
    /// Buckets with no records.
    pub empty_chains: u32,
    /// Length of the shortest chain.
    pub min_chain: u64,
    /// Length of the longest chain.
    pub max_chain: u64,
}

impl Summary {
    /// Average chain length.
    #[must_use]
    pub fn mean_chain(&self) -> f64 {
        if self.hash_size == 0 {
            0.0
        } else {
            self.records as f64 / f64::from(self.hash_size)
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Size of file/data: {}/{}", self.file_size, self.data_end)?;
        writeln!(f, "Number of records: {}", self.records)?;
        writeln!(
            f,
            "Smallest/average/largest chains: {}/{:.2}/{}",
            self.min_chain,
            self.mean_chain(),
            self.max_chain
        )?;
        writeln!(f, "Number of free blocks: {}", self.free_blocks)?;
        writeln!(f, "Largest free block: {}", self.largest_free)?;
        writeln!(
            f,
            "Number of hash buckets: {} ({} empty)",
            self.hash_size, self.empty_chains
        )?;
        writeln!(
            f,
            "Percentage keys/data/padding/free/overhead: {:.0}/{:.0}/{:.0}/{:.0}/{:.0}",
            percent(self.key_bytes, self.data_end),
            percent(self.data_bytes, self.data_end),
            percent(self.padding_bytes, self.data_end),
            percent(self.free_bytes, self.data_end),
            percent(self.overhead_bytes, self.data_end),
        )
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

impl Database {
    /// Walks the file and reports how its space is used.
    ///
    /// # Errors
    ///
    /// `Corrupt` if the data area cannot be walked.
    pub fn summary(&mut self) -> CoreResult<Summary> {
        let result = self.ensure_usable().and_then(|()| {
            self.lock_all_checked(LockKind::Read)?;
            let summary = self.summarize();
            let unlocked = self.unlock_all_raw(false);
            summary.and_then(|summary| unlocked.map(|()| summary))
        });
        self.track(result)
    }

    fn summarize(&self) -> CoreResult<Summary> {
        let data_end = self.data_end()?;
        let mut summary = Summary {
            file_size: self.view_size()?,
            data_end,
            hash_size: self.header.hash_size,
            min_chain: u64::MAX,
            ..Summary::default()
        };

        for block in self.walk_blocks(data_end)?.values() {
            if block.header.is_free() {
                summary.free_blocks += 1;
                summary.free_bytes += block.total;
                summary.largest_free = summary.largest_free.max(block.total);
            } else {
                let key = u64::from(block.header.key_len);
                summary.records += 1;
                summary.key_bytes += key;
                summary.data_bytes += block.header.data_len;
                summary.overhead_bytes += BLOCK_HEADER_SIZE + TAILER_SIZE;
                summary.padding_bytes +=
                    block.total - BLOCK_HEADER_SIZE - TAILER_SIZE - key - block.header.data_len;
            }
        }

        for bucket in 0..self.header.hash_size {
            let len = self.chain_len(bucket)?;
            if len == 0 {
                summary.empty_chains += 1;
            }
            summary.min_chain = summary.min_chain.min(len);
            summary.max_chain = summary.max_chain.max(len);
        }
        if summary.hash_size == 0 {
            summary.min_chain = 0;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, Database, StoreMode};

    #[test]
    fn counts_records_and_free_space() {
        let mut db = Database::open_in_memory(&Config::new().hash_table_size_hint(4)).unwrap();
        db.store(b"abc", b"12345", StoreMode::Insert).unwrap();
        db.store(b"de", b"6", StoreMode::Insert).unwrap();
        db.store(b"gone", b"x", StoreMode::Insert).unwrap();
        db.delete(b"gone").unwrap();

        let summary = db.summary().unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.key_bytes, 5);
        assert_eq!(summary.data_bytes, 6);
        assert_eq!(summary.free_blocks, 2);
        assert_eq!(summary.hash_size, 4);
        assert!(summary.max_chain >= 1);
        assert_eq!(
            summary.key_bytes
                + summary.data_bytes
                + summary.padding_bytes
                + summary.overhead_bytes
                + summary.free_bytes,
            summary.data_end - 96 - 64 - 32
        );
        assert!(summary.to_string().contains("Number of records: 2"));
    }

    #[test]
    fn empty_database() {
        let mut db = Database::open_in_memory(&Config::new().hash_table_size_hint(3)).unwrap();
        let summary = db.summary().unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(summary.empty_chains, 3);
        assert_eq!(summary.min_chain, 0);
        assert_eq!(summary.mean_chain(), 0.0);
    }
}
