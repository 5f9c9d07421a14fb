//! The page pool: a fixed set of in-memory pages with pin accounting.
//!
//! All pages are allocated up front. Allocation hands out ids from a free
//! queue in FIFO order; a page returns to that queue only through an
//! explicit give-back once its pin count has dropped to zero. Every page
//! id is at all times either in the free set or in use, never both.

use std::collections::{HashSet, VecDeque};

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, StorageError};
use crate::pool::guard::{PageGuard, ReadPageGuard, WritePageGuard};
use crate::pool::page::Page;
use crate::types::PageId;

/// Per-page bookkeeping, guarded by the pool's lock
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn new() -> Self {
        Self {
            page_id: PageId::INVALID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

struct PoolState {
    metas: Box<[FrameMeta]>,
    free_set: HashSet<PageId>,
    free_queue: VecDeque<PageId>,
}

/// A fixed pool of equally sized in-memory pages.
///
/// The pool owns the page memory; everything else borrows pages through
/// pinned guards. One lock serializes the free-list and pin operations,
/// and it is never held across a page latch acquisition, so the pool lock
/// and the per-page latches cannot deadlock against each other.
pub struct PagePool {
    pages: Box<[Page]>,
    state: Mutex<PoolState>,
}

/// A point-in-time snapshot of pool occupancy
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Total number of pages in the pool
    pub num_pages: usize,
    /// Pages currently in the free list
    pub free_pages: usize,
    /// In-use pages with a non-zero pin count
    pub pinned_pages: usize,
}

impl PagePool {
    /// Create a pool of `num_pages` zeroed pages, all initially free
    pub fn new(num_pages: usize) -> Self {
        let pages: Box<[Page]> = (0..num_pages).map(|_| Page::new()).collect();
        let metas: Box<[FrameMeta]> = (0..num_pages).map(|_| FrameMeta::new()).collect();
        let mut free_set = HashSet::with_capacity(num_pages);
        let mut free_queue = VecDeque::with_capacity(num_pages);
        for id in 0..num_pages {
            free_set.insert(PageId::new(id as i32));
            free_queue.push_back(PageId::new(id as i32));
        }
        Self {
            pages,
            state: Mutex::new(PoolState {
                metas,
                free_set,
                free_queue,
            }),
        }
    }

    /// Total number of pages in the pool
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Number of pages currently in the free list
    pub fn free_page_count(&self) -> usize {
        self.state.lock().free_set.len()
    }

    /// Take the next free page out of the pool.
    ///
    /// The returned guard owns the page's single pin. The page bytes are
    /// whatever the previous user left there; callers are expected to
    /// initialize a header before interpreting them.
    pub fn next_free_page(&self) -> Result<PageGuard<'_>> {
        let page_id = {
            let mut state = self.state.lock();
            let page_id = state.free_queue.pop_front().ok_or(StorageError::PoolExhausted)?;
            state.free_set.remove(&page_id);
            let meta = &mut state.metas[page_id.index()];
            debug_assert_eq!(meta.pin_count, 0);
            meta.page_id = page_id;
            meta.pin_count = 1;
            page_id
        };
        Ok(PageGuard::new(self, &self.pages[page_id.index()], page_id))
    }

    /// Pin an in-use page and return a latch-free handle to it
    pub fn get_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let idx = self.check_in_use_and_pin(page_id)?;
        Ok(PageGuard::new(self, &self.pages[idx], page_id))
    }

    /// Pin an in-use page and hold its read latch for the guard's lifetime
    pub fn get_page_read(&self, page_id: PageId) -> Result<ReadPageGuard<'_>> {
        Ok(self.get_page(page_id)?.into_read())
    }

    /// Pin an in-use page and hold its write latch for the guard's lifetime
    pub fn get_page_write(&self, page_id: PageId) -> Result<WritePageGuard<'_>> {
        Ok(self.get_page(page_id)?.into_write())
    }

    /// Drop one pin from a page, overwriting its dirty flag.
    ///
    /// Returns false when the id is invalid, the page is free, or the page
    /// was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let Ok(idx) = self.check_range(page_id) else {
            return false;
        };
        let mut state = self.state.lock();
        if state.free_set.contains(&page_id) {
            return false;
        }
        let meta = &mut state.metas[idx];
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        meta.is_dirty = is_dirty;
        true
    }

    /// Return a page to the free list.
    ///
    /// The page must be in use and unpinned; its id is cleared and the id
    /// re-enters the free queue at the back. Returns false otherwise.
    pub fn give_back_page(&self, page_id: PageId) -> bool {
        let Ok(idx) = self.check_range(page_id) else {
            return false;
        };
        let mut state = self.state.lock();
        if state.free_set.contains(&page_id) {
            return false;
        }
        if state.metas[idx].pin_count != 0 {
            debug!(
                "refusing to free page {} with {} pins",
                page_id, state.metas[idx].pin_count
            );
            return false;
        }
        state.metas[idx].page_id = PageId::INVALID;
        state.metas[idx].is_dirty = false;
        state.free_set.insert(page_id);
        state.free_queue.push_back(page_id);
        true
    }

    /// Pin count of an in-use page
    pub fn pin_count(&self, page_id: PageId) -> Result<u32> {
        let idx = self.check_range(page_id)?;
        let state = self.state.lock();
        if state.free_set.contains(&page_id) {
            return Err(StorageError::PageNotInUse(page_id));
        }
        Ok(state.metas[idx].pin_count)
    }

    /// Dirty flag of an in-use page, as left by the last unpin
    pub fn is_dirty(&self, page_id: PageId) -> Result<bool> {
        let idx = self.check_range(page_id)?;
        let state = self.state.lock();
        if state.free_set.contains(&page_id) {
            return Err(StorageError::PageNotInUse(page_id));
        }
        Ok(state.metas[idx].is_dirty)
    }

    /// Whether the page id is currently in the free list
    pub fn is_free(&self, page_id: PageId) -> Result<bool> {
        self.check_range(page_id)?;
        Ok(self.state.lock().free_set.contains(&page_id))
    }

    /// Snapshot of the pool occupancy
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let pinned_pages = state.metas.iter().filter(|m| m.pin_count > 0).count();
        PoolStats {
            num_pages: self.pages.len(),
            free_pages: state.free_set.len(),
            pinned_pages,
        }
    }

    fn check_range(&self, page_id: PageId) -> Result<usize> {
        if !page_id.is_valid() || page_id.index() >= self.pages.len() {
            return Err(StorageError::InvalidPageId(page_id));
        }
        Ok(page_id.index())
    }

    fn check_in_use_and_pin(&self, page_id: PageId) -> Result<usize> {
        let idx = self.check_range(page_id)?;
        let mut state = self.state.lock();
        if state.free_set.contains(&page_id) {
            return Err(StorageError::PageNotInUse(page_id));
        }
        state.metas[idx].pin_count += 1;
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocate_until_exhausted() {
        let pool = PagePool::new(5);
        let mut guards = Vec::new();
        for expected in 0..5 {
            let guard = pool.next_free_page().unwrap();
            assert_eq!(guard.page_id(), PageId::new(expected));
            guards.push(guard);
        }
        assert!(matches!(
            pool.next_free_page(),
            Err(StorageError::PoolExhausted)
        ));
    }

    #[test]
    fn test_page_retains_data_across_fetches() {
        let pool = PagePool::new(3);
        let id = {
            let mut guard = pool.next_free_page().unwrap();
            guard.write()[..4].copy_from_slice(&[1, 2, 3, 4]);
            guard.page_id()
        };

        let guard = pool.get_page(id).unwrap();
        assert_eq!(&guard.read()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_get_page_rejects_bad_ids() {
        let pool = PagePool::new(2);
        assert!(matches!(
            pool.get_page(PageId::new(9)),
            Err(StorageError::InvalidPageId(_))
        ));
        assert!(matches!(
            pool.get_page(PageId::INVALID),
            Err(StorageError::InvalidPageId(_))
        ));
        // all pages are still free
        assert!(matches!(
            pool.get_page(PageId::new(0)),
            Err(StorageError::PageNotInUse(_))
        ));
    }

    #[test]
    fn test_unpin_semantics() {
        let pool = PagePool::new(2);
        let guard = pool.next_free_page().unwrap();
        let id = guard.page_id();

        // second pin through get_page
        let guard2 = pool.get_page(id).unwrap();
        assert_eq!(pool.pin_count(id).unwrap(), 2);
        drop(guard2);
        drop(guard);
        assert_eq!(pool.pin_count(id).unwrap(), 0);

        // unpinning an unpinned page fails
        assert!(!pool.unpin_page(id, false));
        // unpinning a free or out-of-range page fails
        assert!(!pool.unpin_page(PageId::new(1), false));
        assert!(!pool.unpin_page(PageId::new(7), false));
    }

    #[test]
    fn test_give_back_lifecycle() {
        let pool = PagePool::new(2);
        let guard = pool.next_free_page().unwrap();
        let id = guard.page_id();

        // pinned pages cannot be given back
        assert!(!pool.give_back_page(id));
        drop(guard);
        assert!(pool.give_back_page(id));
        // double free fails
        assert!(!pool.give_back_page(id));
        assert!(pool.is_free(id).unwrap());

        // the id goes to the back of the queue
        assert_eq!(pool.next_free_page().unwrap().page_id(), PageId::new(1));
        assert_eq!(pool.next_free_page().unwrap().page_id(), id);
    }

    #[test]
    fn test_free_xor_in_use_invariant() {
        let pool = PagePool::new(8);
        let g0 = pool.next_free_page().unwrap();
        let g1 = pool.next_free_page().unwrap();
        let id0 = g0.page_id();
        drop(g0);
        drop(g1);
        assert!(pool.give_back_page(id0));

        let mut free = 0;
        for i in 0..8 {
            let id = PageId::new(i);
            if pool.is_free(id).unwrap() {
                free += 1;
            } else {
                // in-use pages must be queryable
                pool.pin_count(id).unwrap();
            }
        }
        assert_eq!(free, 7);
        assert_eq!(pool.free_page_count(), 7);
    }

    #[test]
    fn test_stats_snapshot() {
        let pool = PagePool::new(4);
        let _g = pool.next_free_page().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.num_pages, 4);
        assert_eq!(stats.free_pages, 3);
        assert_eq!(stats.pinned_pages, 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["numPages"], 4);
    }

    #[test]
    fn test_concurrent_allocate_and_release() {
        let pool = Arc::new(PagePool::new(64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let id = {
                        let guard = pool.next_free_page().unwrap();
                        guard.page_id()
                    };
                    assert!(pool.give_back_page(id));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.free_page_count(), 64);
    }
}
