//! Key hash functions.
//!
//! The family that created a file is recorded in its header together with
//! a seed and a check value (the hash of a fixed vector), so a reopen can
//! tell whether the caller's hash function is the one the file expects.

use std::fmt;
use std::sync::Arc;

/// Input hashed to produce the header's check value.
pub const HASH_CHECK_VECTOR: &[u8] = b"htdb hash check vector";

const CUSTOM_FLAG: u32 = 0x8000_0000;

/// Identifies which hash function produced a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashFamily {
    /// Bob Jenkins' lookup3 `hashlittle2`, seeded. The default.
    Jenkins,
    /// The classic multiplicative hash; ignores the seed.
    Legacy,
    /// 64-bit FNV-1a with the seed folded into the offset basis.
    Fnv1a,
    /// A caller-supplied function, told apart by its id.
    Custom(u32),
}

impl HashFamily {
    /// Returns the on-disk identifier.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Jenkins => 1,
            Self::Legacy => 2,
            Self::Fnv1a => 3,
            Self::Custom(id) => CUSTOM_FLAG | id,
        }
    }

    /// Parses an on-disk identifier.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Jenkins),
            2 => Some(Self::Legacy),
            3 => Some(Self::Fnv1a),
            _ if raw & CUSTOM_FLAG != 0 => Some(Self::Custom(raw & !CUSTOM_FLAG)),
            _ => None,
        }
    }
}

impl fmt::Display for HashFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jenkins => f.write_str("jenkins"),
            Self::Legacy => f.write_str("legacy"),
            Self::Fnv1a => f.write_str("fnv1a"),
            Self::Custom(id) => write!(f, "custom #{id}"),
        }
    }
}

type CustomFn = Arc<dyn Fn(&[u8], u64) -> u64 + Send + Sync>;

/// A hash function together with its family.
#[derive(Clone)]
pub struct HashFunction {
    family: HashFamily,
    custom: Option<CustomFn>,
}

impl HashFunction {
    /// The default seeded Jenkins hash.
    #[must_use]
    pub fn jenkins() -> Self {
        Self::builtin(HashFamily::Jenkins)
    }

    /// The legacy multiplicative hash.
    #[must_use]
    pub fn legacy() -> Self {
        Self::builtin(HashFamily::Legacy)
    }

    /// Seeded 64-bit FNV-1a.
    #[must_use]
    pub fn fnv1a() -> Self {
        Self::builtin(HashFamily::Fnv1a)
    }

    /// A caller-supplied hash. `id` is recorded in the file; two custom
    /// functions with different ids are different families.
    ///
    /// `id` must fit in 31 bits; the top bit is dropped.
    pub fn custom<F>(id: u32, func: F) -> Self
    where
        F: Fn(&[u8], u64) -> u64 + Send + Sync + 'static,
    {
        Self {
            family: HashFamily::Custom(id & !CUSTOM_FLAG),
            custom: Some(Arc::new(func)),
        }
    }

    /// Returns the built-in function for `family`, or `None` for custom
    /// families, which only the caller can supply.
    #[must_use]
    pub fn for_family(family: HashFamily) -> Option<Self> {
        match family {
            HashFamily::Custom(_) => None,
            builtin => Some(Self::builtin(builtin)),
        }
    }

    fn builtin(family: HashFamily) -> Self {
        Self {
            family,
            custom: None,
        }
    }

    /// Returns the family.
    #[must_use]
    pub fn family(&self) -> HashFamily {
        self.family
    }

    /// Hashes `key` with `seed`.
    #[must_use]
    pub fn hash(&self, key: &[u8], seed: u64) -> u64 {
        if let Some(func) = &self.custom {
            return func(key, seed);
        }
        match self.family {
            HashFamily::Jenkins => jenkins(key, seed),
            HashFamily::Legacy => legacy(key),
            HashFamily::Fnv1a => fnv1a(key, seed),
            HashFamily::Custom(_) => 0,
        }
    }

    /// Returns the header check value for `seed`.
    #[must_use]
    pub fn check_value(&self, seed: u64) -> u64 {
        self.hash(HASH_CHECK_VECTOR, seed)
    }
}

impl Default for HashFunction {
    fn default() -> Self {
        Self::jenkins()
    }
}

impl fmt::Debug for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HashFunction").field(&self.family).finish()
    }
}

/// Seeded Jenkins hash: `hashlittle2` with the low half of the seed as the
/// primary and the high half as the secondary initial value. The primary
/// result occupies the low 32 bits.
#[must_use]
pub fn jenkins(key: &[u8], seed: u64) -> u64 {
    let (c, b) = hashlittle2(key, seed as u32, (seed >> 32) as u32);
    u64::from(c) | (u64::from(b) << 32)
}

fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

fn le_word(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(word)
}

/// lookup3 `hashlittle2` over bytes; returns `(primary, secondary)`.
fn hashlittle2(key: &[u8], pc: u32, pb: u32) -> (u32, u32) {
    let mut a = 0xdead_beef_u32
        .wrapping_add(key.len() as u32)
        .wrapping_add(pc);
    let mut b = a;
    let mut c = a.wrapping_add(pb);

    if key.is_empty() {
        return (c, b);
    }

    let mut rest = key;
    while rest.len() > 12 {
        a = a.wrapping_add(le_word(&rest[0..4]));
        b = b.wrapping_add(le_word(&rest[4..8]));
        c = c.wrapping_add(le_word(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(le_word(&tail[0..4]));
    b = b.wrapping_add(le_word(&tail[4..8]));
    c = c.wrapping_add(le_word(&tail[8..12]));
    final_mix(&mut a, &mut b, &mut c);
    (c, b)
}

/// The classic multiplicative hash, widened to 64 bits.
#[must_use]
pub fn legacy(key: &[u8]) -> u64 {
    let mut value = 0x238F_13AF_u32.wrapping_mul(key.len() as u32);
    for (i, byte) in key.iter().enumerate() {
        let shift = (i * 5 % 24) as u32;
        value = value.wrapping_add(u32::from(*byte) << shift);
    }
    u64::from(1_103_515_243_u32.wrapping_mul(value).wrapping_add(12345))
}

/// 64-bit FNV-1a; the seed is xored into the offset basis.
#[must_use]
pub fn fnv1a(key: &[u8], seed: u64) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    key.iter().fold(OFFSET_BASIS ^ seed, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOUR_SCORE: &[u8] = b"Four score and seven years ago";

    #[test]
    fn hashlittle2_reference_vectors() {
        assert_eq!(hashlittle2(b"", 0, 0), (0xdead_beef, 0xdead_beef));
        assert_eq!(hashlittle2(b"", 0, 0xdead_beef), (0xbd5b_7dde, 0xdead_beef));
        assert_eq!(hashlittle2(FOUR_SCORE, 0, 0).0, 0x1777_0551);
        assert_eq!(hashlittle2(FOUR_SCORE, 1, 0).0, 0xcd62_8161);
    }

    #[test]
    fn jenkins_seed_halves() {
        assert_eq!(jenkins(FOUR_SCORE, 0) as u32, 0x1777_0551);
        assert_eq!(jenkins(FOUR_SCORE, 1) as u32, 0xcd62_8161);
        assert_ne!(jenkins(b"hello", 0), jenkins(b"hello", 1 << 32));
    }

    #[test]
    fn jenkins_block_boundaries() {
        // 12, 13 and 24 bytes exercise the mix/final split
        let data = [0x5au8; 24];
        let twelve = jenkins(&data[..12], 7);
        let thirteen = jenkins(&data[..13], 7);
        let twenty_four = jenkins(&data, 7);
        assert_ne!(twelve, thirteen);
        assert_ne!(thirteen, twenty_four);
        assert_eq!(twenty_four, jenkins(&[0x5au8; 24], 7));
    }

    #[test]
    fn fnv1a_reference_vectors() {
        assert_eq!(fnv1a(b"", 0), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a", 0), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn legacy_ignores_seed() {
        let f = HashFunction::legacy();
        assert_eq!(f.hash(b"key", 1), f.hash(b"key", 2));
        assert_eq!(legacy(b""), 12345);
    }

    #[test]
    fn family_raw_round_trip() {
        for family in [
            HashFamily::Jenkins,
            HashFamily::Legacy,
            HashFamily::Fnv1a,
            HashFamily::Custom(0),
            HashFamily::Custom(42),
        ] {
            assert_eq!(HashFamily::from_raw(family.to_raw()), Some(family));
        }
        assert_eq!(HashFamily::from_raw(0), None);
        assert_eq!(HashFamily::from_raw(77), None);
    }

    #[test]
    fn custom_function_is_used() {
        let f = HashFunction::custom(9, |key, seed| key.len() as u64 + seed);
        assert_eq!(f.family(), HashFamily::Custom(9));
        assert_eq!(f.hash(b"abc", 10), 13);
        assert!(HashFunction::for_family(f.family()).is_none());
        assert_eq!(
            HashFunction::for_family(HashFamily::Fnv1a).unwrap().family(),
            HashFamily::Fnv1a
        );
    }
}
