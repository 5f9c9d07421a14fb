//! Hash table bucket page view.
//!
//! Buckets hold the actual `[key | record id]` items, packed in ascending
//! key order so that membership checks are binary searches. Insert and
//! remove first probe the first and last items to reject out-of-range
//! keys without searching.
//!
//! ```text
//! [key_size:4 | num_items:4 | max_num_items:4] [key rid]*
//! ```

use std::cmp::Ordering;

use crate::key::KeyCompare;
use crate::types::{put_u32, u32_at, RecordId, PAGE_SIZE, RID_SIZE};

/// Size of the bucket page header
pub const BUCKET_HEADER_SIZE: usize = 12;

const KEY_SIZE_OFFSET: usize = 0;
const NUM_ITEMS_OFFSET: usize = 4;
const MAX_ITEMS_OFFSET: usize = 8;

/// Zero-copy view of a bucket page
pub struct HashBucketPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> HashBucketPage<B> {
    /// Interpret a page buffer as a bucket page
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    /// Largest item count a bucket can hold for the given key width
    pub fn max_items_for(key_size: usize) -> usize {
        (PAGE_SIZE - BUCKET_HEADER_SIZE) / (key_size + RID_SIZE)
    }

    fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Key width in bytes
    pub fn key_size(&self) -> usize {
        u32_at(self.data(), KEY_SIZE_OFFSET) as usize
    }

    /// Current item count
    pub fn size(&self) -> usize {
        u32_at(self.data(), NUM_ITEMS_OFFSET) as usize
    }

    /// Maximum item count
    pub fn max_size(&self) -> usize {
        u32_at(self.data(), MAX_ITEMS_OFFSET) as usize
    }

    /// Whether the bucket is at capacity
    pub fn is_full(&self) -> bool {
        self.size() == self.max_size()
    }

    /// Whether the bucket holds no items
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn item_size(&self) -> usize {
        self.key_size() + RID_SIZE
    }

    fn item_offset(&self, pos: usize) -> usize {
        BUCKET_HEADER_SIZE + pos * self.item_size()
    }

    /// Key stored at the given slot
    pub fn key_at(&self, pos: usize) -> &[u8] {
        debug_assert!(pos < self.size());
        let offset = self.item_offset(pos);
        &self.data()[offset..offset + self.key_size()]
    }

    /// Record id stored at the given slot
    pub fn record_at(&self, pos: usize) -> RecordId {
        debug_assert!(pos < self.size());
        let offset = self.item_offset(pos) + self.key_size();
        RecordId::from_bytes(&self.data()[offset..offset + RID_SIZE])
    }

    /// Record id stored under a key, if present
    pub fn lookup(&self, key: &[u8], cmp: &dyn KeyCompare) -> Option<RecordId> {
        if self.is_empty() {
            return None;
        }
        let (found, pos) = self.find(key, cmp);
        found.then(|| self.record_at(pos))
    }

    fn find(&self, key: &[u8], cmp: &dyn KeyCompare) -> (bool, usize) {
        let mut lo = 0;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp.compare(self.key_at(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return (true, mid),
                Ordering::Greater => hi = mid,
            }
        }
        (false, lo)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> HashBucketPage<B> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Initialize a fresh bucket; `max_size` of 0 derives the capacity
    /// from the page size
    pub fn init(&mut self, key_size: usize, max_size: usize) {
        let max = if max_size == 0 {
            Self::max_items_for(key_size)
        } else {
            max_size
        };
        put_u32(self.data_mut(), KEY_SIZE_OFFSET, key_size as u32);
        put_u32(self.data_mut(), NUM_ITEMS_OFFSET, 0);
        put_u32(self.data_mut(), MAX_ITEMS_OFFSET, max as u32);
    }

    fn set_size(&mut self, size: usize) {
        put_u32(self.data_mut(), NUM_ITEMS_OFFSET, size as u32);
    }

    fn write_item_at(&mut self, pos: usize, key: &[u8], rid: RecordId) {
        let key_size = self.key_size();
        let offset = self.item_offset(pos);
        let data = self.data_mut();
        data[offset..offset + key_size].copy_from_slice(key);
        data[offset + key_size..offset + key_size + RID_SIZE].copy_from_slice(&rid.to_bytes());
    }

    fn shift_right_from(&mut self, pos: usize) {
        let item_size = self.item_size();
        let start = self.item_offset(pos);
        let end = self.item_offset(self.size());
        self.data_mut().copy_within(start..end, start + item_size);
    }

    /// Insert an item at its sorted position; fails when the bucket is
    /// full or the key already exists
    pub fn insert(&mut self, key: &[u8], cmp: &dyn KeyCompare, rid: RecordId) -> bool {
        debug_assert_eq!(key.len(), self.key_size());
        let size = self.size();
        if size >= self.max_size() {
            return false;
        }
        if size == 0 {
            self.write_item_at(0, key, rid);
            self.set_size(1);
            return true;
        }

        // probe the boundary items before searching
        match cmp.compare(key, self.key_at(0)) {
            Ordering::Equal => return false,
            Ordering::Less => {
                self.shift_right_from(0);
                self.write_item_at(0, key, rid);
                self.set_size(size + 1);
                return true;
            }
            Ordering::Greater => {}
        }
        match cmp.compare(key, self.key_at(size - 1)) {
            Ordering::Equal => return false,
            Ordering::Greater => {
                self.write_item_at(size, key, rid);
                self.set_size(size + 1);
                return true;
            }
            Ordering::Less => {}
        }

        let (found, pos) = self.find(key, cmp);
        if found {
            return false;
        }
        self.shift_right_from(pos);
        self.write_item_at(pos, key, rid);
        self.set_size(size + 1);
        true
    }

    /// Remove the item under a key; false when the key is absent
    pub fn remove(&mut self, key: &[u8], cmp: &dyn KeyCompare) -> bool {
        let size = self.size();
        if size == 0 {
            return false;
        }

        if cmp.compare(key, self.key_at(0)) == Ordering::Equal {
            self.remove_at(0);
            return true;
        }
        if cmp.compare(key, self.key_at(size - 1)) == Ordering::Equal {
            self.set_size(size - 1);
            return true;
        }

        let (found, pos) = self.find(key, cmp);
        if !found {
            return false;
        }
        self.remove_at(pos);
        true
    }

    /// Remove the item at the given slot, shifting later items left
    pub fn remove_at(&mut self, pos: usize) {
        let size = self.size();
        if pos >= size {
            return;
        }
        let item_size = self.item_size();
        let start = self.item_offset(pos);
        let end = self.item_offset(size);
        self.data_mut().copy_within(start + item_size..end, start);
        self.set_size(size - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{key, rid, U64KeyCompare};
    use crate::types::PAGE_SIZE;

    fn new_bucket(max_size: usize) -> HashBucketPage<Vec<u8>> {
        let mut bucket = HashBucketPage::new(vec![0u8; PAGE_SIZE]);
        bucket.init(8, max_size);
        bucket
    }

    #[test]
    fn test_init_defaults() {
        let bucket = new_bucket(0);
        assert!(bucket.is_empty());
        assert_eq!(bucket.key_size(), 8);
        assert_eq!(bucket.max_size(), (PAGE_SIZE - BUCKET_HEADER_SIZE) / 14);
    }

    #[test]
    fn test_insert_keeps_sorted_order() {
        let cmp = U64KeyCompare;
        let mut bucket = new_bucket(8);
        for k in [4u64, 1, 3, 2] {
            assert!(bucket.insert(&key(k), &cmp, rid(k)));
        }
        assert_eq!(bucket.size(), 4);
        for (pos, k) in (1..=4u64).enumerate() {
            assert_eq!(bucket.key_at(pos), key(k));
            assert_eq!(bucket.record_at(pos), rid(k));
        }
    }

    #[test]
    fn test_duplicates_rejected_on_all_paths() {
        let cmp = U64KeyCompare;
        let mut bucket = new_bucket(8);
        for k in [2u64, 4, 6] {
            assert!(bucket.insert(&key(k), &cmp, rid(k)));
        }
        // first, last, and interior duplicates
        assert!(!bucket.insert(&key(2), &cmp, rid(2)));
        assert!(!bucket.insert(&key(6), &cmp, rid(6)));
        assert!(!bucket.insert(&key(4), &cmp, rid(4)));
        assert_eq!(bucket.size(), 3);
    }

    #[test]
    fn test_insert_fails_when_full() {
        let cmp = U64KeyCompare;
        let mut bucket = new_bucket(2);
        assert!(bucket.insert(&key(1), &cmp, rid(1)));
        assert!(bucket.insert(&key(2), &cmp, rid(2)));
        assert!(bucket.is_full());
        assert!(!bucket.insert(&key(3), &cmp, rid(3)));
    }

    #[test]
    fn test_lookup() {
        let cmp = U64KeyCompare;
        let mut bucket = new_bucket(8);
        for k in [10u64, 20, 30] {
            bucket.insert(&key(k), &cmp, rid(k));
        }
        assert_eq!(bucket.lookup(&key(20), &cmp), Some(rid(20)));
        assert_eq!(bucket.lookup(&key(15), &cmp), None);
        assert_eq!(bucket.lookup(&key(5), &cmp), None);
        assert_eq!(bucket.lookup(&key(35), &cmp), None);
    }

    #[test]
    fn test_remove_first_last_and_middle() {
        let cmp = U64KeyCompare;
        let mut bucket = new_bucket(8);
        for k in 1..=5u64 {
            bucket.insert(&key(k), &cmp, rid(k));
        }
        assert!(bucket.remove(&key(1), &cmp));
        assert!(bucket.remove(&key(5), &cmp));
        assert!(bucket.remove(&key(3), &cmp));
        assert!(!bucket.remove(&key(3), &cmp));
        assert_eq!(bucket.size(), 2);
        assert_eq!(bucket.key_at(0), key(2));
        assert_eq!(bucket.key_at(1), key(4));
    }

    #[test]
    fn test_remove_at_compacts() {
        let cmp = U64KeyCompare;
        let mut bucket = new_bucket(8);
        for k in 1..=3u64 {
            bucket.insert(&key(k), &cmp, rid(k));
        }
        bucket.remove_at(0);
        assert_eq!(bucket.size(), 2);
        assert_eq!(bucket.key_at(0), key(2));
        // out-of-range positions are ignored
        bucket.remove_at(9);
        assert_eq!(bucket.size(), 2);
    }
}
