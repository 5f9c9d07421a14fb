//! Leaf-chain cursor.
//!
//! A cursor walks the singly-linked chain of leaves in key order, holding
//! only the read latch of the leaf it is currently positioned on. It does
//! not take the tree-level latch: concurrent structural changes may cause
//! records to be missed or seen twice, which is a documented limitation of
//! scanning.

use crate::btree::leaf::LeafPage;
use crate::error::Result;
use crate::pool::{PagePool, ReadPageGuard};
use crate::types::{PageId, RecordId};

/// A position in the leaf chain of a B+ tree
///
/// Cursors are move-only and lazily follow next-leaf pointers as they are
/// advanced. Two cursors are equal iff they reference the same page and
/// slot; the end cursor carries the invalid page id.
pub struct Cursor<'a> {
    pool: &'a PagePool,
    page_id: PageId,
    pos: usize,
    guard: Option<ReadPageGuard<'a>>,
}

impl<'a> Cursor<'a> {
    /// Position a cursor at the given leaf slot
    pub(crate) fn at(pool: &'a PagePool, page_id: PageId, pos: usize) -> Result<Self> {
        let mut cursor = Self {
            pool,
            page_id,
            pos,
            guard: None,
        };
        if page_id.is_valid() {
            cursor.guard = Some(pool.get_page_read(page_id)?);
            cursor.skip_exhausted();
        }
        Ok(cursor)
    }

    /// The past-the-end cursor
    pub(crate) fn end(pool: &'a PagePool) -> Self {
        Self {
            pool,
            page_id: PageId::INVALID,
            pos: 0,
            guard: None,
        }
    }

    /// Whether the cursor is past the last record
    pub fn is_end(&self) -> bool {
        !self.page_id.is_valid()
    }

    /// The record id at the current position
    pub fn record(&self) -> Option<RecordId> {
        let guard = self.guard.as_ref()?;
        let leaf = LeafPage::new(guard.data());
        (self.pos < leaf.size()).then(|| leaf.record_at(self.pos))
    }

    /// Step to the next record, following the leaf chain at page ends
    pub fn advance(&mut self) {
        if self.guard.is_some() {
            self.pos += 1;
            self.skip_exhausted();
        }
    }

    /// Move past exhausted leaves; the current leaf's latch is released
    /// before the next leaf's is taken.
    fn skip_exhausted(&mut self) {
        loop {
            let next = match &self.guard {
                None => return,
                Some(guard) => {
                    let leaf = LeafPage::new(guard.data());
                    if self.pos < leaf.size() {
                        return;
                    }
                    leaf.next_page_id()
                }
            };
            self.guard = None;
            self.page_id = PageId::INVALID;
            self.pos = 0;
            if !next.is_valid() {
                return;
            }
            match self.pool.get_page_read(next) {
                Ok(guard) => {
                    self.page_id = next;
                    self.guard = Some(guard);
                }
                // the chain raced with a structural change; stop scanning
                Err(_) => return,
            }
        }
    }
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.pos == other.pos
    }
}

impl Eq for Cursor<'_> {}

impl Iterator for Cursor<'_> {
    type Item = RecordId;

    fn next(&mut self) -> Option<RecordId> {
        let rid = self.record()?;
        self.advance();
        Some(rid)
    }
}
