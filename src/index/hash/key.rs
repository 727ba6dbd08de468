use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::Rid;

/// Fixed-width codec for keys stored in index pages
pub trait IndexKey: Clone + Send + Sync + 'static {
    const ENCODED_SIZE: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

/// Fixed-width codec for values stored in index pages.
///
/// Values must be equality-comparable: the index stores (key, value)
/// pairs and rejects exact duplicates.
pub trait IndexValue: Clone + PartialEq + Send + Sync + 'static {
    const ENCODED_SIZE: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

/// User-supplied key ordering
pub trait KeyComparator<K>: Clone + Send + Sync + 'static {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering;
}

/// User-supplied 32-bit hash over keys
pub trait KeyHasher<K>: Clone + Send + Sync + 'static {
    fn hash_key(&self, key: &K) -> u32;
}

/// Comparator for keys with a natural order
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator
where
    K: Clone + Send + Sync + 'static,
{
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering {
        lhs.cmp(rhs)
    }
}

/// Hashes through the standard hasher, truncated to 32 bits
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyHasher;

impl<K: Hash> KeyHasher<K> for DefaultKeyHasher
where
    K: Clone + Send + Sync + 'static,
{
    fn hash_key(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }
}

/// Fixed-width opaque key of `N` bytes (4, 8, 16, 32 or 64 in practice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenericKey<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> GenericKey<N> {
    /// Build a key from a byte slice, zero-padding or truncating to `N`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; N];
        let len = bytes.len().min(N);
        data[..len].copy_from_slice(&bytes[..len]);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl<const N: usize> IndexKey for GenericKey<N> {
    const ENCODED_SIZE: usize = N;

    fn encode(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self.data);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut data = [0u8; N];
        data.copy_from_slice(&buf[..N]);
        Self { data }
    }
}

impl IndexKey for i32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl IndexKey for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

impl IndexKey for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}

impl IndexValue for i32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl IndexValue for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}

impl IndexValue for Rid {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.page_id);
        LittleEndian::write_u32(&mut buf[4..8], self.slot);
    }

    fn decode(buf: &[u8]) -> Self {
        Rid {
            page_id: LittleEndian::read_u32(&buf[0..4]),
            slot: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}
