//! Transaction state: a page overlay over the file.

use crate::error::{CoreError, CoreResult};
use crate::transaction::journal::{Journal, JournalEntry};
use htdb_storage::{StorageBackend, StorageError};
use std::collections::BTreeMap;

/// Granularity of the overlay.
pub(crate) const PAGE_SIZE: u64 = 4096;

/// One page touched by the transaction.
#[derive(Debug, Clone)]
struct DirtyPage {
    /// Bytes on disk when the page was first written. Zero past the
    /// pre-transaction end of file.
    old: Vec<u8>,
    /// Bytes as the transaction sees them.
    new: Vec<u8>,
}

/// Where a prepared commit wrote its journal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Prepared {
    pub(crate) journal_offset: u64,
    pub(crate) data_end: u64,
}

/// An active transaction.
///
/// Every write lands in the overlay; reads see overlay bytes first and the
/// file underneath. Nothing reaches the file before commit.
#[derive(Debug)]
pub(crate) struct Transaction {
    pages: BTreeMap<u64, DirtyPage>,
    /// File size at start.
    base_size: u64,
    /// Size of the file as the transaction sees it.
    view_size: u64,
    /// Extra `transaction_start` calls still to be matched.
    pub(crate) nesting: u32,
    /// Set when a nested transaction was cancelled.
    pub(crate) poisoned: Option<String>,
    pub(crate) prepared: Option<Prepared>,
}

impl Transaction {
    pub(crate) fn new(base_size: u64) -> Self {
        Self {
            pages: BTreeMap::new(),
            base_size,
            view_size: base_size,
            nesting: 0,
            poisoned: None,
            prepared: None,
        }
    }

    pub(crate) fn base_size(&self) -> u64 {
        self.base_size
    }

    pub(crate) fn view_size(&self) -> u64 {
        self.view_size
    }

    /// Extends the view; new bytes read as zero.
    pub(crate) fn grow(&mut self, new_size: u64) {
        self.view_size = self.view_size.max(new_size);
    }

    /// Returns the number of dirty pages.
    pub(crate) fn dirty_pages(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn read(
        &self,
        io: &dyn StorageBackend,
        offset: u64,
        len: usize,
    ) -> CoreResult<Vec<u8>> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.view_size)
            .ok_or(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.view_size,
            })?;

        let mut buf = vec![0u8; len];
        if offset < self.base_size {
            let on_disk = (end.min(self.base_size) - offset) as usize;
            buf[..on_disk].copy_from_slice(&io.read_at(offset, on_disk)?);
        }

        let first = offset / PAGE_SIZE;
        let last = (end.saturating_sub(1)) / PAGE_SIZE;
        for (&index, page) in self.pages.range(first..=last) {
            let page_start = index * PAGE_SIZE;
            let from = offset.max(page_start);
            let to = end.min(page_start + PAGE_SIZE);
            if from >= to {
                continue;
            }
            let dst = (from - offset) as usize..(to - offset) as usize;
            let src = (from - page_start) as usize..(to - page_start) as usize;
            buf[dst].copy_from_slice(&page.new[src]);
        }
        Ok(buf)
    }

    pub(crate) fn write(
        &mut self,
        io: &dyn StorageBackend,
        offset: u64,
        data: &[u8],
    ) -> CoreResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.view_size)
            .ok_or(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size: self.view_size,
            })?;
        if data.is_empty() {
            return Ok(());
        }

        let mut at = offset;
        while at < end {
            let index = at / PAGE_SIZE;
            let page_start = index * PAGE_SIZE;
            let to = end.min(page_start + PAGE_SIZE);
            if !self.pages.contains_key(&index) {
                let old = self.disk_page(io, page_start)?;
                self.pages.insert(
                    index,
                    DirtyPage {
                        new: old.clone(),
                        old,
                    },
                );
            }
            if let Some(page) = self.pages.get_mut(&index) {
                let dst = (at - page_start) as usize..(to - page_start) as usize;
                let src = (at - offset) as usize..(to - offset) as usize;
                page.new[dst].copy_from_slice(&data[src]);
            }
            at = to;
        }
        Ok(())
    }

    fn disk_page(&self, io: &dyn StorageBackend, page_start: u64) -> CoreResult<Vec<u8>> {
        let mut page = vec![0u8; PAGE_SIZE as usize];
        if page_start < self.base_size {
            let len = (self.base_size - page_start).min(PAGE_SIZE) as usize;
            page[..len].copy_from_slice(&io.read_at(page_start, len)?);
        }
        Ok(page)
    }

    /// Confirms no one changed the file under the transaction.
    pub(crate) fn verify(&self, io: &dyn StorageBackend) -> CoreResult<()> {
        for (&index, page) in &self.pages {
            let page_start = index * PAGE_SIZE;
            if page_start >= self.base_size {
                break;
            }
            let len = (self.base_size - page_start).min(PAGE_SIZE) as usize;
            if io.read_at(page_start, len)? != page.old[..len] {
                return Err(CoreError::transaction_aborted(format!(
                    "page at offset {page_start} changed during the transaction"
                )));
            }
        }
        Ok(())
    }

    /// Builds the journal: every changed byte range within the view.
    pub(crate) fn journal(&self, data_end: u64) -> Journal {
        let mut entries = Vec::new();
        for (&index, page) in &self.pages {
            let page_start = index * PAGE_SIZE;
            if page_start >= self.view_size {
                break;
            }
            let limit = (self.view_size - page_start).min(PAGE_SIZE) as usize;
            let (old, new) = (&page.old[..limit], &page.new[..limit]);
            let Some(first) = old.iter().zip(new).position(|(a, b)| a != b) else {
                continue;
            };
            let last = old
                .iter()
                .zip(new)
                .rposition(|(a, b)| a != b)
                .unwrap_or(first);
            entries.push(JournalEntry {
                offset: page_start + first as u64,
                bytes: new[first..=last].to_vec(),
            });
        }
        Journal { data_end, entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htdb_storage::InMemoryBackend;

    fn backend(len: usize) -> InMemoryBackend {
        InMemoryBackend::with_data((0..len).map(|i| i as u8).collect())
    }

    #[test]
    fn reads_see_own_writes_only() {
        let io = backend(10_000);
        let mut tx = Transaction::new(10_000);

        tx.write(&io, 4090, b"spanning").unwrap();
        assert_eq!(tx.read(&io, 4090, 8).unwrap(), b"spanning");
        assert_eq!(tx.read(&io, 4088, 2).unwrap(), io.read_at(4088, 2).unwrap());
        assert_eq!(io.read_at(4090, 8).unwrap(), backend(10_000).read_at(4090, 8).unwrap());
        assert_eq!(tx.dirty_pages(), 2);
    }

    #[test]
    fn growth_reads_as_zero() {
        let io = backend(100);
        let mut tx = Transaction::new(100);

        assert!(tx.read(&io, 96, 8).is_err());
        tx.grow(8192);
        assert_eq!(tx.read(&io, 96, 8).unwrap()[4..], [0, 0, 0, 0]);
        tx.write(&io, 8000, b"tail").unwrap();
        assert_eq!(tx.read(&io, 7998, 8).unwrap(), b"\0\0tail\0\0");
        assert!(tx.write(&io, 8190, b"over").is_err());
    }

    #[test]
    fn journal_holds_only_changed_bytes() {
        let io = backend(8192);
        let mut tx = Transaction::new(8192);

        tx.write(&io, 10, &[0xff, 11, 0xee]).unwrap();
        let current = io.read_at(5000, 4).unwrap();
        tx.write(&io, 5000, &current).unwrap();

        let journal = tx.journal(8192);
        assert_eq!(journal.entries.len(), 1);
        assert_eq!(journal.entries[0].offset, 10);
        assert_eq!(journal.entries[0].bytes, vec![0xff, 11, 0xee]);
    }

    #[test]
    fn verify_detects_foreign_change() {
        let mut io = backend(4096);
        let mut tx = Transaction::new(4096);
        tx.write(&io, 0, b"x").unwrap();
        tx.verify(&io).unwrap();

        io.write_at(100, b"!").unwrap();
        let err = tx.verify(&io).unwrap_err();
        assert!(matches!(err, CoreError::TransactionAborted { .. }));
    }
}
