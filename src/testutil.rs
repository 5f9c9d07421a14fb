//! Helpers shared by the unit tests: little-endian `u64` keys, a matching
//! comparator, and a hasher that reads the key value back out, so tests
//! can steer keys into specific buckets.

use std::cmp::Ordering;

use crate::key::{KeyCompare, KeyHash};
use crate::types::{PageId, RecordId};

/// Compares 8-byte little-endian unsigned integer keys numerically
pub(crate) struct U64KeyCompare;

impl KeyCompare for U64KeyCompare {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        decode(a).cmp(&decode(b))
    }
}

/// "Hashes" an 8-byte key to its own low 32 bits, making bucket placement
/// a pure function of the key value
pub(crate) struct U64KeyHash;

impl KeyHash for U64KeyHash {
    fn hash(&self, key: &[u8]) -> u32 {
        decode(key) as u32
    }
}

fn decode(key: &[u8]) -> u64 {
    u64::from_le_bytes([
        key[0], key[1], key[2], key[3], key[4], key[5], key[6], key[7],
    ])
}

/// An 8-byte key buffer for the integer `k`
pub(crate) fn key(k: u64) -> [u8; 8] {
    k.to_le_bytes()
}

/// The record id conventionally paired with key `k` in tests
pub(crate) fn rid(k: u64) -> RecordId {
    RecordId::new(PageId::new(k as i32), k as u16)
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
