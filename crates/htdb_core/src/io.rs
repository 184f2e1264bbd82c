//! Reads and writes as the handle sees the file.
//!
//! Inside a transaction every access goes through the transaction's
//! overlay; outside, straight to the backend. Out-of-range accesses are
//! reported as corruption, because every offset the engine follows came
//! from the file itself.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::layout::{field, get_u64, BlockHeader, BLOCK_HEADER_SIZE};

impl Database {
    pub(crate) fn read(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        let result = match &self.transaction {
            Some(tx) => tx.read(&*self.io, offset, len),
            None => self.io.read_at(offset, len).map_err(CoreError::from),
        };
        result.map_err(CoreError::into_corrupt)
    }

    pub(crate) fn read_u64(&self, offset: u64) -> CoreResult<u64> {
        Ok(get_u64(&self.read(offset, 8)?, 0))
    }

    pub(crate) fn read_block(&self, offset: u64) -> CoreResult<BlockHeader> {
        let bytes = self.read(offset, BLOCK_HEADER_SIZE as usize)?;
        Ok(BlockHeader::decode(&bytes))
    }

    pub(crate) fn write(&mut self, offset: u64, data: &[u8]) -> CoreResult<()> {
        let result = match &mut self.transaction {
            Some(tx) => tx.write(&*self.io, offset, data),
            None => self.io.write_at(offset, data).map_err(CoreError::from),
        };
        result.map_err(CoreError::into_corrupt)
    }

    pub(crate) fn write_u32(&mut self, offset: u64, value: u32) -> CoreResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub(crate) fn write_u64(&mut self, offset: u64, value: u64) -> CoreResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub(crate) fn write_block(&mut self, offset: u64, header: &BlockHeader) -> CoreResult<()> {
        self.write(offset, &header.encode())
    }

    /// Size of the file as this handle sees it.
    pub(crate) fn view_size(&self) -> CoreResult<u64> {
        match &self.transaction {
            Some(tx) => Ok(tx.view_size()),
            None => Ok(self.io.size()?),
        }
    }

    /// Grows the file, or only the transaction's view of it.
    pub(crate) fn grow_view(&mut self, new_size: u64) -> CoreResult<()> {
        match &mut self.transaction {
            Some(tx) => {
                tx.grow(new_size);
                Ok(())
            }
            None => Ok(self.io.grow(new_size)?),
        }
    }

    pub(crate) fn data_end(&self) -> CoreResult<u64> {
        self.read_u64(field::DATA_END)
    }
}
