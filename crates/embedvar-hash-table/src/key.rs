//! Key types accepted by the embedding store.
//!
//! Keys are either 64-bit integers or strings. Besides hashing (for the
//! in-memory index) every key type provides a *stable* bucket function, which
//! checkpoint sharding and partitioned restore rely on being identical across
//! processes and runs. `std`'s randomly seeded hashers are never used for it.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Runtime tag for the key type stored in a bundle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Signed 64-bit integer keys.
    Int64,
    /// UTF-8 string keys.
    Utf8,
}

/// A key that can index an embedding store.
pub trait EmbeddingKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Record tag used when keys are exported.
    const KIND: KeyKind;

    /// Returns the key's bucket in `0..bucket_count`.
    ///
    /// Integer keys use the non-negative remainder, so `-1` lands in the
    /// last bucket rather than being lost. String keys use xxh3.
    /// A `bucket_count` of zero is treated as one.
    fn bucket(&self, bucket_count: u64) -> u64;

    /// Appends the wire encoding of this key to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decodes one key from the front of `bytes`, returning it together with
    /// the number of bytes consumed.
    fn decode(bytes: &[u8]) -> Option<(Self, usize)>;
}

impl EmbeddingKey for i64 {
    const KIND: KeyKind = KeyKind::Int64;

    #[inline]
    fn bucket(&self, bucket_count: u64) -> u64 {
        let modulus = i128::from(bucket_count.max(1));
        // rem_euclid is always in 0..modulus, which fits in u64.
        i128::from(*self).rem_euclid(modulus) as u64
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some((i64::from_le_bytes(raw), 8))
    }
}

impl EmbeddingKey for String {
    const KIND: KeyKind = KeyKind::Utf8;

    #[inline]
    fn bucket(&self, bucket_count: u64) -> u64 {
        xxh3_64(self.as_bytes()) % bucket_count.max(1)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let len = self.len() as u32;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        let len = u32::from_le_bytes(raw) as usize;
        let body = bytes.get(4..4 + len)?;
        let key = std::str::from_utf8(body).ok()?.to_string();
        Some((key, 4 + len))
    }
}

/// Returns the restore partition a key belongs to:
/// `key mod bucket_count mod partition_count`.
///
/// This is a pure function of its arguments, so a flat restore buffer can be
/// split across `partition_count` workers without a shuffle step and every
/// worker agrees on ownership.
///
/// ```
/// use embedvar_hash_table::partition_for;
///
/// assert_eq!(partition_for(&17i64, 10, 4), 3);
/// assert_eq!(partition_for(&-1i64, 10, 4), 1);
/// ```
pub fn partition_for<K: EmbeddingKey>(key: &K, bucket_count: u64, partition_count: u64) -> u64 {
    key.bucket(bucket_count) % partition_count.max(1)
}

/// Decodes a contiguous run of encoded keys.
pub fn decode_keys<K: EmbeddingKey>(mut bytes: &[u8]) -> Option<Vec<K>> {
    let mut keys = Vec::new();
    while !bytes.is_empty() {
        let (key, used) = K::decode(bytes)?;
        keys.push(key);
        bytes = &bytes[used..];
    }
    Some(keys)
}
