//! On-disk format.
//!
//! ```text
//! +--------------------+ 0
//! | header (96 bytes)  |
//! +--------------------+ FREELIST_TOP
//! | free-list roots    |  FREE_CLASSES x u64
//! +--------------------+ BUCKET_TOP
//! | chain roots        |  hash_size x u64
//! +--------------------+ data_start
//! | records and free   |  tiled, each block self-describing
//! | blocks             |
//! +--------------------+ data_end
//! | scratch            |  crashed journals, unused growth
//! +--------------------+ physical end of file
//! ```
//!
//! Every block starts with a 40-byte header and ends with an 8-byte tailer
//! holding the block's total length, so the checker can walk the data area
//! both by chains and linearly. All integers are little-endian.

use crate::error::{CoreError, CoreResult};

/// Magic string at offset 0.
pub const MAGIC: [u8; 16] = *b"HTDB file\n\0\0\0\0\0\0";

/// Format version written by this engine.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the fixed header.
pub const HEADER_SIZE: u64 = 96;

/// Leading header bytes the checker verifies. The sequence number and the
/// reserved word after them are not checked.
pub const HEADER_VERIFIABLE_BYTES: u64 = 80;

/// Number of free-list size classes.
pub const FREE_CLASSES: u64 = 8;

/// Offset of the free-list root array.
pub const FREELIST_TOP: u64 = HEADER_SIZE;

/// Offset of the chain root array.
pub const BUCKET_TOP: u64 = FREELIST_TOP + FREE_CLASSES * 8;

/// Hash-table size used when the caller gives no hint.
pub const DEFAULT_HASH_SIZE: u32 = 131;

/// Every block starts and ends on this alignment.
pub const ALIGNMENT: u64 = 8;

/// Size of a block header.
pub const BLOCK_HEADER_SIZE: u64 = 40;

/// Size of the length tailer closing every block.
pub const TAILER_SIZE: u64 = 8;

/// Smallest possible block: a header and a tailer.
pub const MIN_BLOCK_SIZE: u64 = BLOCK_HEADER_SIZE + TAILER_SIZE;

/// Bytes of a free block the checker verifies: magic, chain-next, length
/// and tailer. Key length, data length and hash are left stale on free.
pub const FREE_VERIFIABLE_BYTES: u64 = 4 + 8 + 8 + TAILER_SIZE;

/// Magic of a live record.
pub const RECORD_MAGIC: u32 = 0x5245_4331;

/// Magic of a free block; the complement of [`RECORD_MAGIC`], so no single
/// bit flip turns one into the other.
pub const FREE_MAGIC: u32 = !RECORD_MAGIC;

/// Growth granularity of the data area.
pub const EXPAND_ALIGN: u64 = 4096;

/// Header field offsets.
pub(crate) mod field {
    pub(crate) const VERSION: u64 = 16;
    pub(crate) const HASH_SIZE: u64 = 20;
    pub(crate) const HASH_FAMILY: u64 = 24;
    pub(crate) const FLAGS: u64 = 28;
    pub(crate) const HASH_SEED: u64 = 32;
    pub(crate) const HASH_CHECK: u64 = 40;
    pub(crate) const FREELIST_TOP: u64 = 48;
    pub(crate) const BUCKET_TOP: u64 = 56;
    pub(crate) const DATA_END: u64 = 64;
    pub(crate) const RECOVERY: u64 = 72;
    pub(crate) const SEQUENCE: u64 = 80;
}

/// Block header field offsets, relative to the block.
pub(crate) mod block {
    pub(crate) const MAGIC: u64 = 0;
    pub(crate) const KEY_LEN: u64 = 4;
    pub(crate) const DATA_LEN: u64 = 8;
    pub(crate) const FULL_HASH: u64 = 16;
    pub(crate) const NEXT: u64 = 24;
    pub(crate) const REC_LEN: u64 = 32;
}

/// Offset of the chain root for `bucket`.
#[must_use]
pub const fn bucket_offset(bucket: u32) -> u64 {
    BUCKET_TOP + bucket as u64 * 8
}

/// Offset of the free-list root for `class`.
#[must_use]
pub const fn free_root_offset(class: u64) -> u64 {
    FREELIST_TOP + class * 8
}

/// First byte of the data area for a table of `hash_size` buckets.
#[must_use]
pub const fn data_start(hash_size: u32) -> u64 {
    BUCKET_TOP + hash_size as u64 * 8
}

/// Free-list size class of a block of `total` bytes.
#[must_use]
pub const fn size_class(total: u64) -> u64 {
    let log2 = 63 - (total | 1).leading_zeros() as u64;
    let class = log2.saturating_sub(6);
    if class >= FREE_CLASSES {
        FREE_CLASSES - 1
    } else {
        class
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
pub(crate) fn align_up(value: u64, align: u64) -> CoreResult<u64> {
    value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or_else(|| CoreError::out_of_space(format!("size {value} overflows the file format")))
}

/// Total block length needed to hold a record.
pub(crate) fn record_total(key_len: usize, data_len: usize) -> CoreResult<u64> {
    let body = (key_len as u64)
        .checked_add(data_len as u64)
        .and_then(|n| n.checked_add(MIN_BLOCK_SIZE))
        .ok_or_else(|| CoreError::out_of_space("record too large"))?;
    align_up(body, ALIGNMENT)
}

pub(crate) fn get_u32(buf: &[u8], at: u64) -> u32 {
    let at = at as usize;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn get_u64(buf: &[u8], at: u64) -> u64 {
    let at = at as usize;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn put_u32(buf: &mut [u8], at: u64, value: u32) {
    let at = at as usize;
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: u64, value: u64) {
    let at = at as usize;
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// The fixed file header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) version: u32,
    pub(crate) hash_size: u32,
    pub(crate) hash_family: u32,
    pub(crate) flags: u32,
    pub(crate) hash_seed: u64,
    pub(crate) hash_check: u64,
    pub(crate) freelist_top: u64,
    pub(crate) bucket_top: u64,
    pub(crate) data_end: u64,
    pub(crate) recovery: u64,
    pub(crate) sequence: u64,
}

impl Header {
    /// Header of a freshly created, empty file.
    pub(crate) fn new(hash_size: u32, hash_family: u32, hash_seed: u64, hash_check: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            hash_size,
            hash_family,
            flags: 0,
            hash_seed,
            hash_check,
            freelist_top: FREELIST_TOP,
            bucket_top: BUCKET_TOP,
            data_end: data_start(hash_size),
            recovery: 0,
            sequence: 0,
        }
    }

    pub(crate) fn data_start(&self) -> u64 {
        data_start(self.hash_size)
    }

    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..MAGIC.len()].copy_from_slice(&MAGIC);
        put_u32(&mut buf, field::VERSION, self.version);
        put_u32(&mut buf, field::HASH_SIZE, self.hash_size);
        put_u32(&mut buf, field::HASH_FAMILY, self.hash_family);
        put_u32(&mut buf, field::FLAGS, self.flags);
        put_u64(&mut buf, field::HASH_SEED, self.hash_seed);
        put_u64(&mut buf, field::HASH_CHECK, self.hash_check);
        put_u64(&mut buf, field::FREELIST_TOP, self.freelist_top);
        put_u64(&mut buf, field::BUCKET_TOP, self.bucket_top);
        put_u64(&mut buf, field::DATA_END, self.data_end);
        put_u64(&mut buf, field::RECOVERY, self.recovery);
        put_u64(&mut buf, field::SEQUENCE, self.sequence);
        buf
    }

    /// Parses a header. Only the magic is validated here.
    pub(crate) fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(CoreError::not_a_database(format!(
                "file is {} bytes, shorter than a header",
                buf.len()
            )));
        }
        if buf[..MAGIC.len()] != MAGIC {
            return Err(CoreError::not_a_database("bad magic"));
        }
        Ok(Self {
            version: get_u32(buf, field::VERSION),
            hash_size: get_u32(buf, field::HASH_SIZE),
            hash_family: get_u32(buf, field::HASH_FAMILY),
            flags: get_u32(buf, field::FLAGS),
            hash_seed: get_u64(buf, field::HASH_SEED),
            hash_check: get_u64(buf, field::HASH_CHECK),
            freelist_top: get_u64(buf, field::FREELIST_TOP),
            bucket_top: get_u64(buf, field::BUCKET_TOP),
            data_end: get_u64(buf, field::DATA_END),
            recovery: get_u64(buf, field::RECOVERY),
            sequence: get_u64(buf, field::SEQUENCE),
        })
    }
}

/// Header of a record or free block.
///
/// For free blocks only `magic`, `next` and `rec_len` are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    pub(crate) magic: u32,
    pub(crate) key_len: u32,
    pub(crate) data_len: u64,
    pub(crate) full_hash: u64,
    pub(crate) next: u64,
    pub(crate) rec_len: u64,
}

impl BlockHeader {
    pub(crate) fn free(rec_len: u64) -> Self {
        Self {
            magic: FREE_MAGIC,
            rec_len,
            ..Self::default()
        }
    }

    pub(crate) fn encode(&self) -> [u8; BLOCK_HEADER_SIZE as usize] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        put_u32(&mut buf, block::MAGIC, self.magic);
        put_u32(&mut buf, block::KEY_LEN, self.key_len);
        put_u64(&mut buf, block::DATA_LEN, self.data_len);
        put_u64(&mut buf, block::FULL_HASH, self.full_hash);
        put_u64(&mut buf, block::NEXT, self.next);
        put_u64(&mut buf, block::REC_LEN, self.rec_len);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        Self {
            magic: get_u32(buf, block::MAGIC),
            key_len: get_u32(buf, block::KEY_LEN),
            data_len: get_u64(buf, block::DATA_LEN),
            full_hash: get_u64(buf, block::FULL_HASH),
            next: get_u64(buf, block::NEXT),
            rec_len: get_u64(buf, block::REC_LEN),
        }
    }

    pub(crate) fn is_record(&self) -> bool {
        self.magic == RECORD_MAGIC
    }

    pub(crate) fn is_free(&self) -> bool {
        self.magic == FREE_MAGIC
    }

    /// Total block length, or `None` if `rec_len` is absurd.
    pub(crate) fn total(&self) -> Option<u64> {
        self.rec_len.checked_add(BLOCK_HEADER_SIZE)
    }

    /// Bytes a live record's key, value and tailer occupy in its body.
    pub(crate) fn used(&self) -> Option<u64> {
        u64::from(self.key_len)
            .checked_add(self.data_len)?
            .checked_add(TAILER_SIZE)
    }
}
