//! Commit journal.
//!
//! ```text
//! +----------------+ J
//! | magic (8)      |
//! | data end (8)   |  data end after the commit
//! | entries (8)    |
//! | body len (8)   |
//! +----------------+
//! | offset (8)     |  repeated per entry
//! | len (8)        |
//! | bytes          |  padded to 8
//! +----------------+
//! | crc32 (4)      |  over everything above
//! | pad (4)        |
//! +----------------+
//! ```

use crate::error::{CoreError, CoreResult};
use crate::layout::{get_u32, get_u64, ALIGNMENT};

/// Magic at the start of a journal.
pub(crate) const JOURNAL_MAGIC: [u8; 8] = *b"HTDBJRNL";

/// Size of the fixed journal header.
pub(crate) const JOURNAL_HEADER_SIZE: u64 = 32;

const JOURNAL_TAILER_SIZE: u64 = 8;
const ENTRY_HEADER_SIZE: u64 = 16;

/// Bytes to write at one offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JournalEntry {
    pub(crate) offset: u64,
    pub(crate) bytes: Vec<u8>,
}

/// Everything a commit writes, replayable after a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Journal {
    pub(crate) data_end: u64,
    pub(crate) entries: Vec<JournalEntry>,
}

const fn padded(len: u64) -> u64 {
    (len + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Total journal length for a body of `body_len` bytes.
pub(crate) const fn journal_len(body_len: u64) -> u64 {
    JOURNAL_HEADER_SIZE + body_len + JOURNAL_TAILER_SIZE
}

impl Journal {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let body_len: u64 = self
            .entries
            .iter()
            .map(|entry| ENTRY_HEADER_SIZE + padded(entry.bytes.len() as u64))
            .sum();
        let mut buf = Vec::with_capacity(journal_len(body_len) as usize);
        buf.extend_from_slice(&JOURNAL_MAGIC);
        buf.extend_from_slice(&self.data_end.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        buf.extend_from_slice(&body_len.to_le_bytes());
        for entry in &self.entries {
            let len = entry.bytes.len() as u64;
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&entry.bytes);
            buf.resize(buf.len() + (padded(len) - len) as usize, 0);
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    /// Validates a journal header and returns its body length.
    pub(crate) fn body_len(header: &[u8]) -> CoreResult<u64> {
        if header.len() < JOURNAL_HEADER_SIZE as usize || header[..8] != JOURNAL_MAGIC {
            return Err(CoreError::corrupt("commit journal has a bad magic"));
        }
        Ok(get_u64(header, 24))
    }

    /// Parses and checksums a complete journal.
    pub(crate) fn decode(buf: &[u8]) -> CoreResult<Self> {
        let body_len = Self::body_len(buf)?;
        let total = body_len
            .checked_add(JOURNAL_HEADER_SIZE + JOURNAL_TAILER_SIZE)
            .filter(|&total| total == buf.len() as u64)
            .ok_or_else(|| CoreError::corrupt("commit journal length mismatch"))?;
        let crc_at = total - JOURNAL_TAILER_SIZE;
        if crc32fast::hash(&buf[..crc_at as usize]) != get_u32(buf, crc_at) {
            return Err(CoreError::corrupt("commit journal checksum mismatch"));
        }

        let data_end = get_u64(buf, 8);
        let count = get_u64(buf, 16);
        let mut entries = Vec::new();
        let mut at = JOURNAL_HEADER_SIZE;
        while at < crc_at {
            if at + ENTRY_HEADER_SIZE > crc_at {
                return Err(CoreError::corrupt("commit journal entry overruns its body"));
            }
            let offset = get_u64(buf, at);
            let len = get_u64(buf, at + 8);
            let start = at + ENTRY_HEADER_SIZE;
            let end = len
                .checked_add(ALIGNMENT - 1)
                .and_then(|n| start.checked_add(n & !(ALIGNMENT - 1)))
                .filter(|&end| end <= crc_at)
                .ok_or_else(|| CoreError::corrupt("commit journal entry overruns its body"))?;
            entries.push(JournalEntry {
                offset,
                bytes: buf[start as usize..(start + len) as usize].to_vec(),
            });
            at = end;
        }
        if entries.len() as u64 != count {
            return Err(CoreError::corrupt(format!(
                "commit journal holds {} entries, header says {count}",
                entries.len()
            )));
        }
        Ok(Self { data_end, entries })
    }
}
