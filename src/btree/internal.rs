//! Internal page view.
//!
//! Layout: the shared B+ tree header followed by packed
//! `[key | child page id]` items:
//!
//! ```text
//! [kind:4 | size:4 | max:4 | key_size:4] [key child_page_id]*
//! ```
//!
//! A page of size `n` stores `n` keys and `n + 1` children in a single
//! item array: the key of item 0 is a placeholder that every search
//! skips, and its child is the leftmost subtree. The subtree behind the
//! child of item `i >= 1` holds only keys greater than or equal to the
//! key of item `i`.

use std::cmp::Ordering;

use crate::btree::page::{
    self, BTreePageKind, BTREE_PAGE_HEADER_SIZE, KEY_SIZE_OFFSET, MAX_SIZE_OFFSET, SIZE_OFFSET,
};
use crate::key::KeyCompare;
use crate::types::{page_id_at, put_page_id, put_u32, u32_at, PageId, PAGE_SIZE};

const CHILD_ID_SIZE: usize = 4;

/// Zero-copy view of an internal page
pub struct InternalPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> InternalPage<B> {
    /// Interpret a page buffer as an internal page
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    /// Largest item count an internal page can hold for the given key
    /// width; the usable key capacity is one less, since `n` keys carry
    /// `n + 1` children
    pub fn max_items_for(key_size: usize) -> usize {
        (PAGE_SIZE - BTREE_PAGE_HEADER_SIZE) / (key_size + CHILD_ID_SIZE)
    }

    fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Number of keys currently stored
    pub fn size(&self) -> usize {
        u32_at(self.data(), SIZE_OFFSET) as usize
    }

    /// Maximum number of keys
    pub fn max_size(&self) -> usize {
        u32_at(self.data(), MAX_SIZE_OFFSET) as usize
    }

    /// Key width in bytes
    pub fn key_size(&self) -> usize {
        u32_at(self.data(), KEY_SIZE_OFFSET) as usize
    }

    /// Whether the page is at capacity
    pub fn is_full(&self) -> bool {
        self.size() == self.max_size()
    }

    fn item_size(&self) -> usize {
        self.key_size() + CHILD_ID_SIZE
    }

    fn item_offset(&self, pos: usize) -> usize {
        BTREE_PAGE_HEADER_SIZE + pos * self.item_size()
    }

    /// Key stored at the given slot; slot 0 holds the ignored placeholder
    pub fn key_at(&self, pos: usize) -> &[u8] {
        let offset = self.item_offset(pos);
        &self.data()[offset..offset + self.key_size()]
    }

    /// Child page id stored at the given slot
    pub fn child_at(&self, pos: usize) -> PageId {
        debug_assert!(pos <= self.size());
        page_id_at(self.data(), self.item_offset(pos) + self.key_size())
    }

    /// Slot of the child subtree that may contain the key: the largest
    /// slot in `[0, size]` whose key is less than or equal to the target,
    /// treating the slot-0 key as negative infinity
    pub fn find_child(&self, key: &[u8], cmp: &dyn KeyCompare) -> usize {
        let n = self.size();
        debug_assert!(n > 0);
        let mut result = 0;
        let mut lo = 1;
        let mut hi = n;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            match cmp.compare(self.key_at(mid), key) {
                Ordering::Equal => return mid,
                Ordering::Less => {
                    result = mid;
                    lo = mid + 1;
                }
                Ordering::Greater => {
                    if mid == 1 {
                        break;
                    }
                    hi = mid - 1;
                }
            }
        }
        result
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> InternalPage<B> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Initialize a fresh internal page; `max_size` of 0 derives the key
    /// capacity from the page size
    pub fn init(&mut self, key_size: usize, max_size: usize) {
        let max = if max_size == 0 {
            Self::max_items_for(key_size) - 1
        } else {
            max_size
        };
        page::write_header(self.data_mut(), BTreePageKind::Internal, max, key_size);
    }

    /// Overwrite the key count
    pub fn set_size(&mut self, size: usize) {
        put_u32(self.data_mut(), SIZE_OFFSET, size as u32);
    }

    /// Overwrite the child page id at the given slot
    pub fn set_child_at(&mut self, pos: usize, page_id: PageId) {
        let offset = self.item_offset(pos) + self.key_size();
        put_page_id(self.data_mut(), offset, page_id);
    }

    /// Overwrite the separator key at the given slot
    pub fn update_key_at(&mut self, pos: usize, key: &[u8]) {
        debug_assert_eq!(key.len(), self.key_size());
        let offset = self.item_offset(pos);
        self.data_mut()[offset..offset + key.len()].copy_from_slice(key);
    }

    /// Insert a separator and its child at the given slot (never slot 0),
    /// shifting later items right
    pub fn insert_at(&mut self, pos: usize, key: &[u8], child: PageId) {
        let size = self.size();
        debug_assert!(pos >= 1 && pos <= size + 1);
        debug_assert_eq!(key.len(), self.key_size());
        let item_size = self.item_size();

        let start = self.item_offset(pos);
        let end = self.item_offset(size + 1);
        let data = self.data_mut();
        if start < end {
            data.copy_within(start..end, start + item_size);
        }
        data[start..start + key.len()].copy_from_slice(key);
        put_page_id(data, start + key.len(), child);
        self.set_size(size + 1);
    }

    /// Remove the item (key and child) at the given slot, shifting later
    /// items left
    pub fn remove_at(&mut self, pos: usize) {
        let size = self.size();
        if size == 0 {
            return;
        }
        debug_assert!(pos <= size);
        let item_size = self.item_size();
        let start = self.item_offset(pos);
        let end = self.item_offset(size + 1);
        self.data_mut().copy_within(start + item_size..end, start);
        self.set_size(size - 1);
    }

    /// Insert a separator and its child at the sorted position
    pub fn insert(&mut self, key: &[u8], child: PageId, cmp: &dyn KeyCompare) {
        debug_assert!(self.size() > 0);
        let pos = self.find_child(key, cmp);
        self.insert_at(pos + 1, key, child);
    }

    /// Replace this page's items with the tail of `src` starting at item
    /// `start`; the item at `start` becomes this page's slot 0, its key
    /// the new placeholder
    pub fn take_from(&mut self, src: &InternalPage<impl AsRef<[u8]>>, start: usize) {
        debug_assert!(start <= src.size());
        let count = src.size() - start + 1;
        let item_size = self.item_size();
        let from = src.item_offset(start);
        let len = count * item_size;
        self.data_mut()[BTREE_PAGE_HEADER_SIZE..BTREE_PAGE_HEADER_SIZE + len]
            .copy_from_slice(&src.data()[from..from + len]);
        self.set_size(count - 1);
    }

    /// Append all items of the right sibling, writing `separator` as the
    /// key at the merge boundary
    pub fn merge_from_right(&mut self, right: &InternalPage<impl AsRef<[u8]>>, separator: &[u8]) {
        let size = self.size();
        let count = right.size() + 1;
        let item_size = self.item_size();
        let dst = self.item_offset(size + 1);
        let len = count * item_size;
        {
            let from = right.item_offset(0);
            self.data_mut()[dst..dst + len]
                .copy_from_slice(&right.data()[from..from + len]);
        }
        self.update_key_at(size + 1, separator);
        self.set_size(size + count);
    }

    /// Move the first `count` items of the right sibling to this page's
    /// tail, writing `separator` at the boundary; the sibling compacts
    /// down
    pub fn move_from_right(
        &mut self,
        right: &mut InternalPage<impl AsRef<[u8]> + AsMut<[u8]>>,
        count: usize,
        separator: &[u8],
    ) {
        let size = self.size();
        let item_size = self.item_size();
        let dst = self.item_offset(size + 1);
        let len = count * item_size;
        {
            let from = right.item_offset(0);
            self.data_mut()[dst..dst + len]
                .copy_from_slice(&right.data()[from..from + len]);
        }
        self.update_key_at(size + 1, separator);
        self.set_size(size + count);

        let remaining = right.size() + 1 - count;
        let start = right.item_offset(count);
        let end = right.item_offset(count + remaining);
        right.data_mut().copy_within(start..end, BTREE_PAGE_HEADER_SIZE);
        let right_size = right.size();
        right.set_size(right_size - count);
    }

    /// Move the last `count` items of the left sibling in front of this
    /// page's items, writing `separator` over the old placeholder key
    pub fn move_from_left(
        &mut self,
        left: &mut InternalPage<impl AsRef<[u8]> + AsMut<[u8]>>,
        count: usize,
        separator: &[u8],
    ) {
        let size = self.size();
        let item_size = self.item_size();

        // make room for the incoming items
        let end = self.item_offset(size + 1);
        self.data_mut()
            .copy_within(BTREE_PAGE_HEADER_SIZE..end, BTREE_PAGE_HEADER_SIZE + count * item_size);

        // pull the tail of the left sibling in
        let from = left.item_offset(left.size() - count + 1);
        let len = count * item_size;
        self.data_mut()[BTREE_PAGE_HEADER_SIZE..BTREE_PAGE_HEADER_SIZE + len]
            .copy_from_slice(&left.data()[from..from + len]);

        // the shifted old placeholder becomes a real separator
        self.update_key_at(count, separator);
        self.set_size(size + count);
        let left_size = left.size();
        left.set_size(left_size - count);
    }
}
