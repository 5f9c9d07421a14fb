//! Hash table directory page view.
//!
//! A directory maps the low `global_depth` bits of a hash to a bucket
//! page. Each slot also records the bucket's local depth: the number of
//! hash bits that actually distinguish that bucket's residents. A bucket
//! of local depth `l` is referenced by exactly `2^(global_depth - l)`
//! slots.
//!
//! ```text
//! [max_depth:4 | global_depth:4] [local_depth:1]* [bucket_page_id:4]*
//! ```

use crate::types::{page_id_at, put_page_id, put_u32, u32_at, PageId};

/// Upper bound on the directory depth; sizes the on-page arrays
pub const DIRECTORY_MAX_DEPTH: u32 = 9;

const ARRAY_SIZE: usize = 1 << DIRECTORY_MAX_DEPTH;
const MAX_DEPTH_OFFSET: usize = 0;
const GLOBAL_DEPTH_OFFSET: usize = 4;
const LOCAL_DEPTHS_OFFSET: usize = 8;
const BUCKET_IDS_OFFSET: usize = LOCAL_DEPTHS_OFFSET + ARRAY_SIZE;

/// Zero-copy view of a directory page
pub struct HashDirectoryPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> HashDirectoryPage<B> {
    /// Interpret a page buffer as a directory page
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Largest depth this directory may grow to
    pub fn max_depth(&self) -> u32 {
        u32_at(self.data(), MAX_DEPTH_OFFSET)
    }

    /// Number of hash bits currently indexing the directory
    pub fn global_depth(&self) -> u32 {
        u32_at(self.data(), GLOBAL_DEPTH_OFFSET)
    }

    /// Number of active slots
    pub fn size(&self) -> usize {
        1 << self.global_depth()
    }

    /// Bucket slot for a hash: its low `global_depth` bits
    pub fn hash_to_bucket_index(&self, hash: u32) -> usize {
        (hash as usize) & (self.size() - 1)
    }

    /// Bucket page referenced by the given slot
    pub fn bucket_page_id(&self, idx: usize) -> PageId {
        debug_assert!(idx < ARRAY_SIZE);
        page_id_at(self.data(), BUCKET_IDS_OFFSET + idx * 4)
    }

    /// Local depth recorded at the given slot
    pub fn local_depth(&self, idx: usize) -> u32 {
        debug_assert!(idx < ARRAY_SIZE);
        u32::from(self.data()[LOCAL_DEPTHS_OFFSET + idx])
    }

    /// The slot paired with `idx` by the newest distinguishing bit of its
    /// bucket
    pub fn split_image_index(&self, idx: usize) -> usize {
        let local_depth = self.local_depth(idx);
        debug_assert!(local_depth > 0);
        idx ^ (1 << (local_depth - 1))
    }

    /// A directory may halve when every slot in the upper half mirrors its
    /// partner in the lower half
    pub fn can_shrink(&self) -> bool {
        let size = self.size();
        if size < 2 {
            return false;
        }
        let half = size / 2;
        for idx in 0..half {
            if self.local_depth(idx) != self.local_depth(idx + half)
                || self.bucket_page_id(idx) != self.bucket_page_id(idx + half)
            {
                return false;
            }
        }
        true
    }

    /// Check the directory invariants: every local depth is bounded by the
    /// global depth, slots sharing a bucket agree on its local depth, and
    /// each bucket is referenced exactly `2^(global_depth - local_depth)`
    /// times
    pub fn verify_integrity(&self) -> bool {
        let size = self.size();
        let global_depth = self.global_depth();

        for idx in 0..size {
            if self.local_depth(idx) > global_depth {
                return false;
            }
        }

        for i in 0..size.saturating_sub(1) {
            let page_id = self.bucket_page_id(i);
            let depth = self.local_depth(i);
            for j in i + 1..size {
                if self.bucket_page_id(j) == page_id && self.local_depth(j) != depth {
                    return false;
                }
            }
        }

        for idx in 0..size {
            let page_id = self.bucket_page_id(idx);
            let expected = 1usize << (global_depth - self.local_depth(idx));
            let actual = (0..size)
                .filter(|&j| self.bucket_page_id(j) == page_id)
                .count();
            if actual != expected {
                return false;
            }
        }

        true
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> HashDirectoryPage<B> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Initialize a fresh directory at global depth 0 with no buckets
    pub fn init(&mut self, max_depth: u32) {
        debug_assert!(max_depth <= DIRECTORY_MAX_DEPTH);
        put_u32(self.data_mut(), MAX_DEPTH_OFFSET, max_depth);
        put_u32(self.data_mut(), GLOBAL_DEPTH_OFFSET, 0);
        for idx in 0..ARRAY_SIZE {
            self.set_local_depth(idx, 0);
            self.set_bucket_page_id(idx, PageId::INVALID);
        }
    }

    /// Point a slot at a bucket page
    pub fn set_bucket_page_id(&mut self, idx: usize, page_id: PageId) {
        debug_assert!(idx < ARRAY_SIZE);
        put_page_id(self.data_mut(), BUCKET_IDS_OFFSET + idx * 4, page_id);
    }

    /// Record a slot's local depth
    pub fn set_local_depth(&mut self, idx: usize, depth: u32) {
        debug_assert!(idx < ARRAY_SIZE);
        self.data_mut()[LOCAL_DEPTHS_OFFSET + idx] = depth as u8;
    }

    /// Double the active slots: each new slot mirrors its image in the
    /// current half, then the global depth grows by one
    pub fn incr_global_depth(&mut self) {
        debug_assert!(self.global_depth() < self.max_depth());
        let size = self.size();
        for idx in 0..size {
            let depth = self.local_depth(idx);
            let page_id = self.bucket_page_id(idx);
            self.set_local_depth(idx + size, depth);
            self.set_bucket_page_id(idx + size, page_id);
        }
        let global_depth = self.global_depth();
        put_u32(self.data_mut(), GLOBAL_DEPTH_OFFSET, global_depth + 1);
    }

    /// Halve the active slots
    pub fn decr_global_depth(&mut self) {
        debug_assert!(self.global_depth() > 0);
        let global_depth = self.global_depth();
        put_u32(self.data_mut(), GLOBAL_DEPTH_OFFSET, global_depth - 1);
    }
}
