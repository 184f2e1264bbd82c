//! Free-space allocator.
//!
//! Free blocks sit in [`FREE_CLASSES`] singly linked lists by size class.
//! Allocation is first fit, starting at the request's own class; a block
//! larger than needed is split and the tail handed out, so the free block
//! keeps its offset and usually its list position. Freeing pushes onto the
//! class list without coalescing.
//!
//! Every function here runs under the allocator lock or inside a
//! transaction.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::layout::{
    align_up, block, field, free_root_offset, size_class, BlockHeader, BLOCK_HEADER_SIZE,
    EXPAND_ALIGN, FREE_CLASSES, FREE_MAGIC, MIN_BLOCK_SIZE, TAILER_SIZE,
};
use crate::lock::ALLOC_LOCK;
use htdb_storage::{LockKind, LockWait};
use tracing::debug;

impl Database {
    /// Runs `op` holding the allocator lock.
    pub(crate) fn with_alloc_lock<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.lock_offset(ALLOC_LOCK, LockKind::Write, LockWait::Wait)?;
        let result = op(self);
        let unlocked = self.unlock_offset(ALLOC_LOCK);
        result.and_then(|value| unlocked.map(|()| value))
    }

    /// Upper bound on the length of any list in a file of this size.
    pub(crate) fn walk_limit(&self) -> CoreResult<u64> {
        Ok(self.view_size()? / MIN_BLOCK_SIZE + 1)
    }

    /// Allocates a block of at least `total` bytes and returns its offset
    /// and body length. The block's content is left for the caller.
    pub(crate) fn allocate(&mut self, total: u64) -> CoreResult<(u64, u64)> {
        if let Some(found) = self.take_free(total)? {
            return Ok(found);
        }
        self.expand_by(total)?;
        self.take_free(total)?
            .ok_or_else(|| CoreError::corrupt("no free block fits after expanding the file"))
    }

    fn take_free(&mut self, total: u64) -> CoreResult<Option<(u64, u64)>> {
        let limit = self.walk_limit()?;
        for class in size_class(total)..FREE_CLASSES {
            let mut link = free_root_offset(class);
            let mut current = self.read_u64(link)?;
            let mut steps = 0;
            while current != 0 {
                steps += 1;
                if steps > limit {
                    return Err(CoreError::corrupt(format!("free list {class} loops")));
                }
                let free = self.read_free(current)?;
                let block_total = free.rec_len + BLOCK_HEADER_SIZE;
                if block_total >= total {
                    let remainder = block_total - total;
                    if remainder >= MIN_BLOCK_SIZE {
                        self.shrink_free(link, current, &free, class, remainder)?;
                        return Ok(Some((current + remainder, total - BLOCK_HEADER_SIZE)));
                    }
                    self.write_u64(link, free.next)?;
                    return Ok(Some((current, free.rec_len)));
                }
                link = current + block::NEXT;
                current = free.next;
            }
        }
        Ok(None)
    }

    /// Cuts a free block down to its first `remainder` bytes.
    fn shrink_free(
        &mut self,
        link: u64,
        offset: u64,
        free: &BlockHeader,
        class: u64,
        remainder: u64,
    ) -> CoreResult<()> {
        self.write_u64(offset + block::REC_LEN, remainder - BLOCK_HEADER_SIZE)?;
        self.write_u64(offset + remainder - TAILER_SIZE, remainder)?;
        let new_class = size_class(remainder);
        if new_class != class {
            self.write_u64(link, free.next)?;
            self.link_free(offset, new_class)?;
        }
        Ok(())
    }

    /// Reads a block a free list points at.
    fn read_free(&self, offset: u64) -> CoreResult<BlockHeader> {
        let free = self.read_block(offset)?;
        if !free.is_free() {
            return Err(CoreError::corrupt(format!(
                "free list points at offset {offset}, which is not a free block"
            )));
        }
        match free.total() {
            Some(total) if total >= MIN_BLOCK_SIZE => Ok(free),
            _ => Err(CoreError::corrupt(format!(
                "free block at offset {offset} has length {}",
                free.rec_len
            ))),
        }
    }

    fn link_free(&mut self, offset: u64, class: u64) -> CoreResult<()> {
        let root = free_root_offset(class);
        let head = self.read_u64(root)?;
        self.write_u64(offset + block::NEXT, head)?;
        self.write_u64(root, offset)
    }

    fn unlink_free(&mut self, offset: u64, class: u64) -> CoreResult<()> {
        let limit = self.walk_limit()?;
        let mut link = free_root_offset(class);
        let mut current = self.read_u64(link)?;
        let mut steps = 0;
        while current != 0 {
            steps += 1;
            if steps > limit {
                return Err(CoreError::corrupt(format!("free list {class} loops")));
            }
            let next = self.read_free(current)?.next;
            if current == offset {
                return self.write_u64(link, next);
            }
            link = current + block::NEXT;
            current = next;
        }
        Err(CoreError::corrupt(format!(
            "free block at offset {offset} is missing from free list {class}"
        )))
    }

    /// Returns the block at `offset` to the free lists. Only the magic and
    /// the chain pointer change; the length and tailer stay valid.
    pub(crate) fn free_block(&mut self, offset: u64, total: u64) -> CoreResult<()> {
        self.write_u32(offset + block::MAGIC, FREE_MAGIC)?;
        self.link_free(offset, size_class(total))
    }

    /// Grows the data area by at least `needed` bytes, leaving the new space
    /// in one free block.
    pub(crate) fn expand_by(&mut self, needed: u64) -> CoreResult<()> {
        let data_start = self.header.data_start();
        let data_end = self.data_end()?;
        let growth = needed.max(data_end / 4).max(MIN_BLOCK_SIZE);
        let new_end = data_end
            .checked_add(growth)
            .ok_or_else(|| CoreError::out_of_space(format!("cannot grow by {growth} bytes")))
            .and_then(|end| align_up(end, EXPAND_ALIGN))?;

        self.grow_view(new_end)?;

        let start = match self.trailing_free_block(data_start, data_end)? {
            Some((offset, class)) => {
                self.unlink_free(offset, class)?;
                self.write_u64(offset + block::REC_LEN, new_end - offset - BLOCK_HEADER_SIZE)?;
                offset
            }
            None => {
                let free = BlockHeader::free(new_end - data_end - BLOCK_HEADER_SIZE);
                self.write_block(data_end, &free)?;
                data_end
            }
        };
        self.write_u64(new_end - TAILER_SIZE, new_end - start)?;
        self.write_u64(field::DATA_END, new_end)?;
        self.link_free(start, size_class(new_end - start))?;

        self.stats.record_expansion();
        debug!(name = %self.name(), from = data_end, to = new_end, "expanded data area");
        Ok(())
    }

    /// Finds a free block ending exactly at `data_end`, through its tailer.
    fn trailing_free_block(&self, data_start: u64, data_end: u64) -> CoreResult<Option<(u64, u64)>> {
        if data_end < data_start + MIN_BLOCK_SIZE {
            return Ok(None);
        }
        let total = self.read_u64(data_end - TAILER_SIZE)?;
        if total % 8 != 0 || total < MIN_BLOCK_SIZE || total > data_end - data_start {
            return Ok(None);
        }
        let offset = data_end - total;
        let candidate = self.read_block(offset)?;
        if candidate.is_free() && candidate.total() == Some(total) {
            Ok(Some((offset, size_class(total))))
        } else {
            Ok(None)
        }
    }

    /// Grows the data area by at least `additional` bytes.
    ///
    /// The file normally grows on demand; this reserves space up front.
    pub fn expand(&mut self, additional: u64) -> CoreResult<()> {
        let result = self
            .ensure_writable()
            .and_then(|()| self.with_alloc_lock(|db| db.expand_by(additional)));
        if let Err(err) = &result {
            self.note_write_failure(err);
        }
        self.track(result)
    }
}
