//! Hash chains: bucket selection and chain walks.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::layout::{block, bucket_offset, BlockHeader, BLOCK_HEADER_SIZE};

/// A record located in its chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Found {
    pub(crate) offset: u64,
    /// Offset of the pointer to this record: the bucket root or the
    /// predecessor's `next` field.
    pub(crate) link: u64,
    pub(crate) header: BlockHeader,
}

impl Found {
    pub(crate) fn key_len(&self) -> u64 {
        u64::from(self.header.key_len)
    }

    pub(crate) fn value_offset(&self) -> u64 {
        self.offset + BLOCK_HEADER_SIZE + self.key_len()
    }

    pub(crate) fn total(&self) -> u64 {
        self.header.rec_len + BLOCK_HEADER_SIZE
    }
}

impl Database {
    pub(crate) fn key_hash(&self, key: &[u8]) -> u64 {
        self.hash.hash(key, self.header.hash_seed)
    }

    pub(crate) fn bucket_for_hash(&self, hash: u64) -> u32 {
        // The remainder is below hash_size, a u32.
        (hash % u64::from(self.header.hash_size)) as u32
    }

    /// Bucket `key` belongs to.
    pub(crate) fn bucket_of(&self, key: &[u8]) -> u32 {
        self.bucket_for_hash(self.key_hash(key))
    }

    /// Reads a chain member and checks it is a well-formed record.
    fn read_record(&self, bucket: u32, offset: u64) -> CoreResult<BlockHeader> {
        let header = self.read_block(offset)?;
        if !header.is_record() {
            return Err(CoreError::corrupt(format!(
                "chain {bucket} points at offset {offset}, which is not a record"
            )));
        }
        match header.used() {
            Some(used) if used <= header.rec_len => Ok(header),
            _ => Err(CoreError::corrupt(format!(
                "record at offset {offset} does not fit its block"
            ))),
        }
    }

    /// Calls `visit` with every record of a chain, in chain order, until it
    /// returns true.
    fn walk_chain(
        &self,
        bucket: u32,
        mut visit: impl FnMut(u64, u64, &BlockHeader) -> CoreResult<bool>,
    ) -> CoreResult<()> {
        let limit = self.walk_limit()?;
        let mut link = bucket_offset(bucket);
        let mut current = self.read_u64(link)?;
        let mut steps = 0;
        while current != 0 {
            steps += 1;
            if steps > limit {
                return Err(CoreError::corrupt(format!("chain {bucket} loops")));
            }
            let header = self.read_record(bucket, current)?;
            if visit(current, link, &header)? {
                return Ok(());
            }
            link = current + block::NEXT;
            current = header.next;
        }
        Ok(())
    }

    /// Finds `key` in its chain. The stored hash is compared before the key
    /// bytes are read.
    pub(crate) fn find(&self, bucket: u32, key: &[u8], hash: u64) -> CoreResult<Option<Found>> {
        let mut found = None;
        self.walk_chain(bucket, |offset, link, header| {
            if header.full_hash != hash || header.key_len as usize != key.len() {
                return Ok(false);
            }
            if self.read(offset + BLOCK_HEADER_SIZE, key.len())? != key {
                return Ok(false);
            }
            found = Some(Found {
                offset,
                link,
                header: *header,
            });
            Ok(true)
        })?;
        Ok(found)
    }

    /// Offsets and stored hashes of every record in a chain.
    pub(crate) fn chain_members(&self, bucket: u32) -> CoreResult<Vec<(u64, u64)>> {
        let mut members = Vec::new();
        self.walk_chain(bucket, |offset, _, header| {
            members.push((offset, header.full_hash));
            Ok(false)
        })?;
        Ok(members)
    }

    /// Number of records in a chain.
    pub(crate) fn chain_len(&self, bucket: u32) -> CoreResult<u64> {
        let mut len = 0;
        self.walk_chain(bucket, |_, _, _| {
            len += 1;
            Ok(false)
        })?;
        Ok(len)
    }

    /// Takes a record out of its chain.
    pub(crate) fn unlink(&mut self, found: &Found) -> CoreResult<()> {
        self.write_u64(found.link, found.header.next)?;
        self.generation += 1;
        Ok(())
    }

    /// Makes the record at `offset`, whose `next` already points at the old
    /// head, the head of `bucket`.
    pub(crate) fn link_head(&mut self, bucket: u32, offset: u64) -> CoreResult<()> {
        self.write_u64(bucket_offset(bucket), offset)?;
        self.generation += 1;
        Ok(())
    }
}
