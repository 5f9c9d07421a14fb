//! Extendible hash table over pooled pages.
//!
//! The table is a three-tier page hierarchy: a header page routes the top
//! bits of a key's hash to a directory page, the directory routes the low
//! bits to a bucket page, and buckets hold the items. Directory and
//! bucket pages are created lazily on first insert. A full bucket splits,
//! doubling the directory in place when the bucket's local depth has
//! caught up with the global depth; an emptied bucket folds back into its
//! split image, halving the directory when both halves agree.
//!
//! A single table-level latch covers every operation: insert and remove
//! take it exclusively, lookups take it shared.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::error::{Result, StorageError};
use crate::hash::bucket::HashBucketPage;
use crate::hash::directory::{HashDirectoryPage, DIRECTORY_MAX_DEPTH};
use crate::hash::header::{HashHeaderPage, HEADER_MAX_DEPTH};
use crate::key::{KeyCompare, KeyHash};
use crate::pool::{PagePool, WritePageGuard};
use crate::types::{PageId, RecordId};

/// An extendible hash table mapping fixed-width keys to record ids
pub struct ExtendibleHashTable {
    pool: Arc<PagePool>,
    cmp: Box<dyn KeyCompare>,
    hasher: Box<dyn KeyHash>,
    key_size: usize,
    directory_max_depth: u32,
    bucket_max_size: usize,
    header_page_id: PageId,
    latch: RwLock<()>,
}

impl ExtendibleHashTable {
    /// Create an empty table.
    ///
    /// `header_max_depth` and `directory_max_depth` bound how many hash
    /// bits the header and directories may consume; a `bucket_max_size`
    /// of 0 derives the bucket capacity from the page size.
    pub fn new(
        pool: Arc<PagePool>,
        cmp: Box<dyn KeyCompare>,
        hasher: Box<dyn KeyHash>,
        key_size: usize,
        header_max_depth: u32,
        directory_max_depth: u32,
        bucket_max_size: usize,
    ) -> Result<Self> {
        if header_max_depth > HEADER_MAX_DEPTH {
            return Err(StorageError::InvalidDepth {
                requested: header_max_depth,
                limit: HEADER_MAX_DEPTH,
            });
        }
        if directory_max_depth > DIRECTORY_MAX_DEPTH {
            return Err(StorageError::InvalidDepth {
                requested: directory_max_depth,
                limit: DIRECTORY_MAX_DEPTH,
            });
        }
        let bucket_limit = HashBucketPage::<&[u8]>::max_items_for(key_size);
        let bucket_max_size = match bucket_max_size {
            0 => bucket_limit,
            n if n < bucket_limit => n,
            n => {
                return Err(StorageError::InvalidCapacity {
                    requested: n,
                    limit: bucket_limit,
                })
            }
        };

        let mut header_guard = pool.next_free_page()?.into_write();
        let header_page_id = header_guard.page_id();
        HashHeaderPage::new(header_guard.data_mut()).init(header_max_depth);
        drop(header_guard);

        Ok(Self {
            pool,
            cmp,
            hasher,
            key_size,
            directory_max_depth,
            bucket_max_size,
            header_page_id,
            latch: RwLock::new(()),
        })
    }

    /// Page id of the header page
    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    /// Insert a key/record pair; returns false when the key is already
    /// present or the table cannot grow any further for that key
    pub fn insert(&self, key: &[u8], rid: RecordId) -> Result<bool> {
        self.check_key(key)?;
        let _latch = self.latch.write();
        let hash = self.hasher.hash(key);

        let mut header_guard = self.pool.get_page_write(self.header_page_id)?;
        let (directory_idx, directory_page_id) = {
            let header = HashHeaderPage::new(header_guard.data());
            let idx = header.hash_to_directory_index(hash);
            (idx, header.directory_page_id(idx))
        };

        let mut directory_guard = if directory_page_id.is_valid() {
            self.pool.get_page_write(directory_page_id)?
        } else {
            let mut guard = self.pool.next_free_page()?.into_write();
            HashDirectoryPage::new(guard.data_mut()).init(self.directory_max_depth);
            HashHeaderPage::new(header_guard.data_mut())
                .set_directory_page_id(directory_idx, guard.page_id());
            debug!("directory {} installed at header slot {}", guard.page_id(), directory_idx);
            guard
        };

        let (bucket_idx, bucket_page_id) = {
            let directory = HashDirectoryPage::new(directory_guard.data());
            let idx = directory.hash_to_bucket_index(hash);
            (idx, directory.bucket_page_id(idx))
        };

        let mut bucket_guard = if bucket_page_id.is_valid() {
            self.pool.get_page_write(bucket_page_id)?
        } else {
            let mut guard = self.pool.next_free_page()?.into_write();
            HashBucketPage::new(guard.data_mut()).init(self.key_size, self.bucket_max_size);
            let mut directory = HashDirectoryPage::new(directory_guard.data_mut());
            directory.set_bucket_page_id(bucket_idx, guard.page_id());
            directory.set_local_depth(bucket_idx, 0);
            guard
        };

        self.insert_to_bucket(&mut directory_guard, &mut bucket_guard, bucket_idx, hash, key, rid)
    }

    /// Remove a key; returns false when it is not present
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let _latch = self.latch.write();
        let hash = self.hasher.hash(key);
        let mut dropped = Vec::new();

        let removed = {
            let header_guard = self.pool.get_page_read(self.header_page_id)?;
            let directory_page_id = {
                let header = HashHeaderPage::new(header_guard.data());
                header.directory_page_id(header.hash_to_directory_index(hash))
            };
            if !directory_page_id.is_valid() {
                return Ok(false);
            }

            let mut directory_guard = self.pool.get_page_write(directory_page_id)?;
            let (bucket_idx, bucket_page_id) = {
                let directory = HashDirectoryPage::new(directory_guard.data());
                let idx = directory.hash_to_bucket_index(hash);
                (idx, directory.bucket_page_id(idx))
            };
            if !bucket_page_id.is_valid() {
                return Ok(false);
            }

            let mut bucket_guard = self.pool.get_page_write(bucket_page_id)?;
            let removed =
                HashBucketPage::new(bucket_guard.data_mut()).remove(key, self.cmp.as_ref());
            if removed && HashBucketPage::new(bucket_guard.data()).is_empty() {
                self.fold_empty_bucket(&mut directory_guard, bucket_idx, &mut dropped);
            }
            removed
        };

        for page_id in dropped {
            if !self.pool.give_back_page(page_id) {
                warn!("failed to give back page {}", page_id);
            }
        }
        Ok(removed)
    }

    /// Look up the record id stored under a key
    pub fn get(&self, key: &[u8]) -> Result<Option<RecordId>> {
        self.check_key(key)?;
        let _latch = self.latch.read();
        let hash = self.hasher.hash(key);

        let header_guard = self.pool.get_page_read(self.header_page_id)?;
        let directory_page_id = {
            let header = HashHeaderPage::new(header_guard.data());
            header.directory_page_id(header.hash_to_directory_index(hash))
        };
        if !directory_page_id.is_valid() {
            return Ok(None);
        }

        let directory_guard = self.pool.get_page_read(directory_page_id)?;
        let bucket_page_id = {
            let directory = HashDirectoryPage::new(directory_guard.data());
            directory.bucket_page_id(directory.hash_to_bucket_index(hash))
        };
        if !bucket_page_id.is_valid() {
            return Ok(None);
        }

        let bucket_guard = self.pool.get_page_read(bucket_page_id)?;
        Ok(HashBucketPage::new(bucket_guard.data()).lookup(key, self.cmp.as_ref()))
    }

    /// Check the invariants of every installed directory page
    pub fn verify_integrity(&self) -> Result<bool> {
        let _latch = self.latch.read();
        let header_guard = self.pool.get_page_read(self.header_page_id)?;
        let header = HashHeaderPage::new(header_guard.data());
        for idx in 0..header.max_size() {
            let page_id = header.directory_page_id(idx);
            if page_id.is_valid() {
                let directory_guard = self.pool.get_page_read(page_id)?;
                if !HashDirectoryPage::new(directory_guard.data()).verify_integrity() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(StorageError::InvalidKeySize {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    /// Insert into the bucket currently owning `hash`, splitting on
    /// overflow; splits may cascade when every item lands on one side
    fn insert_to_bucket(
        &self,
        directory_guard: &mut WritePageGuard<'_>,
        bucket_guard: &mut WritePageGuard<'_>,
        bucket_idx: usize,
        hash: u32,
        key: &[u8],
        rid: RecordId,
    ) -> Result<bool> {
        {
            let mut bucket = HashBucketPage::new(bucket_guard.data_mut());
            if !bucket.is_full() {
                return Ok(bucket.insert(key, self.cmp.as_ref(), rid));
            }
            if bucket.lookup(key, self.cmp.as_ref()).is_some() {
                return Ok(false);
            }
        }

        let (local_depth, global_depth, max_depth) = {
            let directory = HashDirectoryPage::new(directory_guard.data());
            (
                directory.local_depth(bucket_idx),
                directory.global_depth(),
                directory.max_depth(),
            )
        };
        if local_depth == global_depth {
            if global_depth == max_depth {
                debug!("insert rejected: directory already at max depth {}", max_depth);
                return Ok(false);
            }
            HashDirectoryPage::new(directory_guard.data_mut()).incr_global_depth();
        }

        let mut split_guard = self.pool.next_free_page()?.into_write();
        let split_page_id = split_guard.page_id();
        HashBucketPage::new(split_guard.data_mut()).init(self.key_size, self.bucket_max_size);

        let new_depth = local_depth + 1;
        let split_bit = 1usize << (new_depth - 1);
        let split_idx = bucket_idx ^ split_bit;
        let old_page_id = bucket_guard.page_id();

        // every slot referencing the overflowing bucket gets the new
        // depth; those on the new bit's other side move to the split page
        {
            let mut directory = HashDirectoryPage::new(directory_guard.data_mut());
            for idx in 0..directory.size() {
                if directory.bucket_page_id(idx) == old_page_id {
                    directory.set_local_depth(idx, new_depth);
                    if idx & split_bit == split_idx & split_bit {
                        directory.set_bucket_page_id(idx, split_page_id);
                    }
                }
            }
        }
        debug!(
            "bucket {} split into {} at local depth {}",
            old_page_id, split_page_id, new_depth
        );

        // rehash: items whose newly significant bit matches the split
        // image move over
        let local_mask = (1usize << new_depth) - 1;
        let mut moved = Vec::new();
        {
            let mut bucket = HashBucketPage::new(bucket_guard.data_mut());
            let mut idx = 0;
            while idx < bucket.size() {
                let item_hash = self.hasher.hash(bucket.key_at(idx));
                if (item_hash as usize) & local_mask == split_idx & local_mask {
                    moved.push((bucket.key_at(idx).to_vec(), bucket.record_at(idx)));
                    bucket.remove_at(idx);
                } else {
                    idx += 1;
                }
            }
        }
        {
            let mut split_bucket = HashBucketPage::new(split_guard.data_mut());
            for (moved_key, moved_rid) in &moved {
                split_bucket.insert(moved_key, self.cmp.as_ref(), *moved_rid);
            }
        }

        // retry in whichever bucket now owns the pending key
        let (target_idx, target_page_id) = {
            let directory = HashDirectoryPage::new(directory_guard.data());
            let idx = directory.hash_to_bucket_index(hash);
            (idx, directory.bucket_page_id(idx))
        };
        if target_page_id == old_page_id {
            self.insert_to_bucket(directory_guard, bucket_guard, target_idx, hash, key, rid)
        } else {
            self.insert_to_bucket(directory_guard, &mut split_guard, target_idx, hash, key, rid)
        }
    }

    /// Fold an emptied bucket back into its split image and shrink the
    /// directory when both halves agree
    fn fold_empty_bucket(
        &self,
        directory_guard: &mut WritePageGuard<'_>,
        bucket_idx: usize,
        dropped: &mut Vec<PageId>,
    ) {
        let mut directory = HashDirectoryPage::new(directory_guard.data_mut());
        if directory.global_depth() == 0 {
            return;
        }
        let local_depth = directory.local_depth(bucket_idx);
        if local_depth == 0 {
            return;
        }
        let split_idx = directory.split_image_index(bucket_idx);
        // only buckets at the same depth are buddies; a deeper image must
        // fold first
        if directory.local_depth(split_idx) != local_depth {
            return;
        }
        let image_page_id = directory.bucket_page_id(split_idx);
        let empty_page_id = directory.bucket_page_id(bucket_idx);
        if !image_page_id.is_valid() || image_page_id == empty_page_id {
            return;
        }

        let new_depth = local_depth - 1;
        for idx in 0..directory.size() {
            let id = directory.bucket_page_id(idx);
            if id == empty_page_id || id == image_page_id {
                directory.set_bucket_page_id(idx, image_page_id);
                directory.set_local_depth(idx, new_depth);
            }
        }
        dropped.push(empty_page_id);
        debug!("empty bucket {} folded into {}", empty_page_id, image_page_id);

        if directory.can_shrink() {
            directory.decr_global_depth();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{init_logging, key, rid, U64KeyCompare, U64KeyHash};
    use std::thread;

    fn make_table(
        num_pages: usize,
        header_max_depth: u32,
        directory_max_depth: u32,
        bucket_max_size: usize,
    ) -> ExtendibleHashTable {
        init_logging();
        let pool = Arc::new(PagePool::new(num_pages));
        ExtendibleHashTable::new(
            pool,
            Box::new(U64KeyCompare),
            Box::new(U64KeyHash),
            8,
            header_max_depth,
            directory_max_depth,
            bucket_max_size,
        )
        .unwrap()
    }

    /// Global depth of the directory the hash 0 routes to
    fn global_depth_of(table: &ExtendibleHashTable) -> u32 {
        let header_guard = table.pool.get_page_read(table.header_page_id).unwrap();
        let directory_page_id = {
            let header = HashHeaderPage::new(header_guard.data());
            header.directory_page_id(header.hash_to_directory_index(0))
        };
        let directory_guard = table.pool.get_page_read(directory_page_id).unwrap();
        HashDirectoryPage::new(directory_guard.data()).global_depth()
    }

    #[test]
    fn test_depth_and_capacity_validation() {
        let pool = Arc::new(PagePool::new(4));
        let result = ExtendibleHashTable::new(
            pool.clone(),
            Box::new(U64KeyCompare),
            Box::new(U64KeyHash),
            8,
            10,
            2,
            2,
        );
        assert!(matches!(result, Err(StorageError::InvalidDepth { .. })));

        let result = ExtendibleHashTable::new(
            pool,
            Box::new(U64KeyCompare),
            Box::new(U64KeyHash),
            8,
            0,
            2,
            100_000,
        );
        assert!(matches!(result, Err(StorageError::InvalidCapacity { .. })));
    }

    #[test]
    fn test_key_size_is_checked() {
        let table = make_table(4, 0, 2, 2);
        assert!(matches!(
            table.get(b"short"),
            Err(StorageError::InvalidKeySize {
                expected: 8,
                actual: 5
            })
        ));
    }

    #[test]
    fn test_missing_key_without_pages() {
        let table = make_table(4, 0, 2, 2);
        assert_eq!(table.get(&key(1)).unwrap(), None);
        assert!(!table.remove(&key(1)).unwrap());
    }

    #[test]
    fn test_insert_to_capacity() {
        // a depth-2 directory with two-item buckets holds exactly eight
        // consecutive keys under the identity hash
        let table = make_table(10, 0, 2, 2);
        for k in 0..8u64 {
            assert!(table.insert(&key(k), rid(k)).unwrap(), "insert {}", k);
        }
        assert!(table.verify_integrity().unwrap());

        for k in 0..8u64 {
            assert_eq!(table.get(&key(k)).unwrap(), Some(rid(k)), "get {}", k);
        }

        assert!(!table.insert(&key(8), rid(8)).unwrap());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let table = make_table(10, 0, 2, 2);
        assert!(table.insert(&key(3), rid(3)).unwrap());
        assert!(!table.insert(&key(3), rid(99)).unwrap());
        assert_eq!(table.get(&key(3)).unwrap(), Some(rid(3)));
    }

    #[test]
    fn test_insert_remove_roundtrip() {
        let table = make_table(16, 2, 3, 2);
        for k in 0..5u64 {
            assert!(table.insert(&key(k), rid(k)).unwrap(), "insert {}", k);
        }
        assert!(table.verify_integrity().unwrap());

        for k in 0..5u64 {
            assert!(table.remove(&key(k)).unwrap(), "remove {}", k);
        }
        for k in 0..5u64 {
            assert_eq!(table.get(&key(k)).unwrap(), None, "get {}", k);
        }
        assert!(table.verify_integrity().unwrap());
    }

    #[test]
    fn test_directory_grows_and_shrinks() {
        let table = make_table(32, 0, 3, 2);
        for k in 0..8u64 {
            assert!(table.insert(&key(k), rid(k)).unwrap());
            assert!(table.verify_integrity().unwrap(), "after insert {}", k);
        }
        assert!(global_depth_of(&table) > 0);

        for k in 0..8u64 {
            assert!(table.remove(&key(k)).unwrap());
            assert!(table.verify_integrity().unwrap(), "after remove {}", k);
        }
        assert_eq!(global_depth_of(&table), 0);
    }

    #[test]
    fn test_freed_buckets_return_to_the_pool() {
        let table = make_table(32, 0, 3, 2);
        let free_before = table.pool.free_page_count();
        for k in 0..8u64 {
            table.insert(&key(k), rid(k)).unwrap();
        }
        for k in 0..8u64 {
            table.remove(&key(k)).unwrap();
        }
        // everything except the header, the directory, and the last
        // remaining bucket is back in the free list
        assert!(table.pool.free_page_count() >= free_before - 3);
    }

    #[test]
    fn test_skewed_keys_cascade_splits() {
        // keys congruent mod 8 collide until the sixth bit tells them apart
        let table = make_table(64, 0, 9, 2);
        let keys: Vec<u64> = (0..6).map(|i| i * 8).collect();
        for &k in &keys {
            assert!(table.insert(&key(k), rid(k)).unwrap(), "insert {}", k);
            assert!(table.verify_integrity().unwrap());
        }
        for &k in &keys {
            assert_eq!(table.get(&key(k)).unwrap(), Some(rid(k)));
        }
    }

    #[test]
    fn test_multiple_directories() {
        // top two hash bits select among four directories
        let table = make_table(64, 2, 3, 2);
        let spread: Vec<u64> = (0..4).map(|i| i << 30).collect();
        for &k in &spread {
            assert!(table.insert(&key(k), rid(k)).unwrap());
        }
        assert!(table.verify_integrity().unwrap());
        for &k in &spread {
            assert_eq!(table.get(&key(k)).unwrap(), Some(rid(k)));
        }
    }

    #[test]
    fn test_randomized_workload() {
        let table = make_table(256, 1, 9, 4);
        for k in 0..100u64 {
            assert!(table.insert(&key(k), rid(k)).unwrap(), "insert {}", k);
        }
        assert!(table.verify_integrity().unwrap());

        for k in (0..100u64).step_by(2) {
            assert!(table.remove(&key(k)).unwrap(), "remove {}", k);
        }
        assert!(table.verify_integrity().unwrap());
        for k in 0..100u64 {
            let expected = (k % 2 == 1).then(|| rid(k));
            assert_eq!(table.get(&key(k)).unwrap(), expected, "get {}", k);
        }
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        init_logging();
        let pool = Arc::new(PagePool::new(256));
        let table = Arc::new(
            ExtendibleHashTable::new(
                pool,
                Box::new(U64KeyCompare),
                Box::new(U64KeyHash),
                8,
                0,
                9,
                2,
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for half in 0..2u64 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let (lo, hi) = if half == 0 { (0, 39) } else { (40, 79) };
                for k in lo..=hi {
                    assert!(table.insert(&key(k), rid(k)).unwrap(), "insert {}", k);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(table.verify_integrity().unwrap());
        for k in 0..80u64 {
            assert_eq!(table.get(&key(k)).unwrap(), Some(rid(k)), "get {}", k);
        }
    }
}
