//! Key and value codec.
//!
//! Keys are opaque, totally-ordered byte strings. The penciller core only
//! needs three things from them: the total order, an end-of-range test for
//! half-open upper bounds, and a 32-bit magic hash that gates point lookups.
//! Keys carrying the index tag decline to hash and are therefore reachable
//! only through range folds.
//!
//! Values are opaque payloads; the core reads nothing from them but the
//! sequence number.

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Leading tag byte for object keys (point-lookable).
pub const TAG_OBJECT: u8 = b'o';
/// Leading tag byte for index keys (range-only).
pub const TAG_INDEX: u8 = b'i';

/// An ordered ledger key. The byte encoding is `tag ‖ bucket ‖ 0x00 ‖ rest`,
/// which keeps keys grouped by bucket under the lexicographic order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// An object key: `bucket` and `key` name a stored value.
    pub fn object(bucket: &[u8], key: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(2 + bucket.len() + key.len());
        bytes.push(TAG_OBJECT);
        bytes.extend_from_slice(bucket);
        bytes.push(0);
        bytes.extend_from_slice(key);
        Key(bytes)
    }

    /// An index key: a secondary `term` pointing at `key` within `bucket`.
    /// Index keys are not point-lookable.
    pub fn index(bucket: &[u8], term: &[u8], key: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(3 + bucket.len() + term.len() + key.len());
        bytes.push(TAG_INDEX);
        bytes.extend_from_slice(bucket);
        bytes.push(0);
        bytes.extend_from_slice(term);
        bytes.push(0);
        bytes.extend_from_slice(key);
        Key(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The magic hash of a key, or a refusal to hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyHash {
    Lookup(u32),
    NoLookup,
}

/// Hash a key for the point-lookup fast path. Index keys return `NoLookup`.
pub fn magic_hash(key: &Key) -> KeyHash {
    match key.0.first() {
        Some(&TAG_INDEX) => KeyHash::NoLookup,
        _ => KeyHash::Lookup(CRC32.checksum(&key.0)),
    }
}

/// True once `key` has passed the upper bound of a range. `None` is the open
/// upper bound sentinel and is never passed.
pub fn endkey_passed(end: Option<&Key>, key: &Key) -> bool {
    match end {
        None => false,
        Some(end) => end < key,
    }
}

/// Record status as assigned by the upstream journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Active { ttl: Option<u64> },
    Tombstone,
}

/// An opaque ledger value. The core reads only the SQN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    sqn: u64,
    status: Status,
    hash: Option<u32>,
    metadata: Vec<u8>,
}

impl Value {
    pub fn new(sqn: u64, status: Status, hash: Option<u32>, metadata: Vec<u8>) -> Self {
        Self {
            sqn,
            status,
            hash,
            metadata,
        }
    }

    /// A live value with no TTL and no cached hash.
    pub fn active(sqn: u64) -> Self {
        Self::new(sqn, Status::Active { ttl: None }, None, Vec::new())
    }

    /// A deletion marker.
    pub fn tombstone(sqn: u64) -> Self {
        Self::new(sqn, Status::Tombstone, None, Vec::new())
    }

    /// The sequence-only accessor; everything else in the value is opaque
    /// to the penciller.
    pub fn sqn(&self) -> u64 {
        self.sqn
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.status, Status::Tombstone)
    }

    pub fn cached_hash(&self) -> Option<u32> {
        self.hash
    }
}

/// Outcome of comparing the front records of two merge sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dominance {
    /// Left key sorts first; emit left.
    LeftFirst,
    /// Right key sorts first; emit right.
    RightFirst,
    /// Same key, left shadows right; drop right.
    LeftDominant,
    /// Same key, right shadows left; drop left.
    RightDominant,
}

/// Dominance comparison for the range-fold merge. Equal keys resolve by SQN
/// with ties going left, so callers holding the in-memory stream place it on
/// the left to shadow equal-SQN file records.
pub fn key_dominates(left: &(Key, Value), right: &(Key, Value)) -> Dominance {
    match left.0.cmp(&right.0) {
        std::cmp::Ordering::Less => Dominance::LeftFirst,
        std::cmp::Ordering::Greater => Dominance::RightFirst,
        std::cmp::Ordering::Equal => {
            if left.1.sqn() >= right.1.sqn() {
                Dominance::LeftDominant
            } else {
                Dominance::RightDominant
            }
        }
    }
}
