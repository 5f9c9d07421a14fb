//! B+ tree over pooled pages.
//!
//! The tree indexes fixed-width binary keys to record ids. All state
//! lives in page buffers interpreted through the leaf and internal views;
//! the struct itself only tracks the root page id.
//!
//! A single tree-level latch covers every operation: insert and remove
//! take it exclusively, lookups take it shared. Cursors deliberately
//! bypass it (see `cursor.rs`).

use std::cmp::Ordering;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use serde::Serialize;

use crate::btree::cursor::Cursor;
use crate::btree::internal::InternalPage;
use crate::btree::leaf::LeafPage;
use crate::btree::page;
use crate::error::{Result, StorageError};
use crate::key::KeyCompare;
use crate::pool::{PageGuard, PagePool};
use crate::types::{PageId, RecordId};

/// What happened below when an insert came back up a level
enum InsertOutcome {
    /// The key was already present
    Duplicate,
    /// Inserted without structural change at this level
    Inserted,
    /// The page split; the new right sibling must be linked into the
    /// parent under its first key
    Split(PageId),
}

/// A serializable snapshot of the tree structure
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeExport {
    /// Page id of this node
    pub page_id: i32,
    /// Whether this node is a leaf
    pub is_leaf: bool,
    /// Keys stored in the node (separators for internal nodes)
    pub keys: Vec<Vec<u8>>,
    /// Child nodes, empty for leaves
    pub children: Vec<TreeExport>,
}

/// A B+ tree mapping fixed-width keys to record ids
pub struct BPlusTree {
    pool: Arc<PagePool>,
    cmp: Box<dyn KeyCompare>,
    key_size: usize,
    leaf_max: usize,
    internal_max: usize,
    /// Root page id; the lock doubles as the tree-level latch
    root: RwLock<PageId>,
}

impl BPlusTree {
    /// Create an empty tree with a single leaf root.
    ///
    /// A `leaf_max_size` or `internal_max_size` of 0 derives the capacity
    /// from the page size; explicit values must stay below the derived
    /// limit.
    pub fn new(
        pool: Arc<PagePool>,
        cmp: Box<dyn KeyCompare>,
        key_size: usize,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let leaf_limit = LeafPage::<&[u8]>::max_items_for(key_size);
        let leaf_max = match leaf_max_size {
            0 => leaf_limit,
            n if n < leaf_limit => n,
            n => {
                return Err(StorageError::InvalidCapacity {
                    requested: n,
                    limit: leaf_limit,
                })
            }
        };
        let internal_limit = InternalPage::<&[u8]>::max_items_for(key_size);
        let internal_max = match internal_max_size {
            0 => internal_limit - 1,
            n if n < internal_limit => n,
            n => {
                return Err(StorageError::InvalidCapacity {
                    requested: n,
                    limit: internal_limit,
                })
            }
        };

        let mut root_guard = pool.next_free_page()?;
        let root_id = root_guard.page_id();
        {
            let mut data = root_guard.write();
            LeafPage::new(&mut *data).init(key_size, leaf_max);
        }
        drop(root_guard);

        Ok(Self {
            pool,
            cmp,
            key_size,
            leaf_max,
            internal_max,
            root: RwLock::new(root_id),
        })
    }

    /// Current root page id
    pub fn root_page_id(&self) -> PageId {
        *self.root.read()
    }

    /// Look up the record id stored under a key
    pub fn get(&self, key: &[u8]) -> Result<Option<RecordId>> {
        self.check_key(key)?;
        let root = self.root.read();
        let mut page_id = *root;
        loop {
            let guard = self.pool.get_page(page_id)?;
            let data = guard.read();
            if page::is_leaf(&data) {
                let leaf = LeafPage::new(&*data);
                let (found, pos) = leaf.find(key, self.cmp.as_ref());
                return Ok(found.then(|| leaf.record_at(pos)));
            }
            let internal = InternalPage::new(&*data);
            page_id = internal.child_at(internal.find_child(key, self.cmp.as_ref()));
        }
    }

    /// Insert a key/record pair; returns false when the key is already
    /// present
    pub fn insert(&self, key: &[u8], rid: RecordId) -> Result<bool> {
        self.check_key(key)?;
        let mut root = self.root.write();
        let root_id = *root;

        let outcome = {
            let mut guard = self.pool.get_page(root_id)?;
            let leaf_root = page::is_leaf(&guard.read());
            if leaf_root {
                self.insert_into_leaf(&mut guard, key, rid)?
            } else {
                drop(guard);
                self.insert_rec(root_id, key, rid)?
            }
        };

        match outcome {
            InsertOutcome::Duplicate => Ok(false),
            InsertOutcome::Inserted => Ok(true),
            InsertOutcome::Split(right_id) => {
                // the old root becomes the leftmost child of a fresh root
                let separator = self.first_key_of(right_id)?;
                let mut new_root_guard = self.pool.next_free_page()?;
                let new_root_id = new_root_guard.page_id();
                {
                    let mut data = new_root_guard.write();
                    let mut new_root = InternalPage::new(&mut *data);
                    new_root.init(self.key_size, self.internal_max);
                    new_root.set_child_at(0, root_id);
                    new_root.insert_at(1, &separator, right_id);
                }
                *root = new_root_id;
                debug!(
                    "new root {} over {} and {}",
                    new_root_id, root_id, right_id
                );
                Ok(true)
            }
        }
    }

    /// Remove a key; returns false when it was not present
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let mut root = self.root.write();
        let root_id = *root;
        let mut dropped = Vec::new();

        let removed = {
            let mut guard = self.pool.get_page(root_id)?;
            if page::is_leaf(&guard.read()) {
                let (found, pos) = {
                    let data = guard.read();
                    LeafPage::new(&*data).find(key, self.cmp.as_ref())
                };
                if found {
                    let mut data = guard.write();
                    LeafPage::new(&mut *data).remove_at(pos);
                }
                found
            } else {
                drop(guard);
                let removed = self.remove_rec(root_id, root_id, key, &mut dropped)?;
                if removed {
                    // a root holding a single child pointer hands the
                    // root role to that child
                    let guard = self.pool.get_page(root_id)?;
                    let (size, first_child) = {
                        let data = guard.read();
                        let root_page = InternalPage::new(&*data);
                        (root_page.size(), root_page.child_at(0))
                    };
                    drop(guard);
                    if size == 0 {
                        *root = first_child;
                        dropped.push(root_id);
                        debug!("root {} collapsed into {}", root_id, first_child);
                    }
                }
                removed
            }
        };

        self.release_dropped(&mut dropped);
        Ok(removed)
    }

    /// Cursor over all records, starting at the smallest key
    pub fn iter(&self) -> Result<Cursor<'_>> {
        let root_id = *self.root.read();
        let leaf_id = self.first_leaf_id(root_id)?;
        Cursor::at(self.pool.as_ref(), leaf_id, 0)
    }

    /// Cursor positioned on an exact key, or the end cursor when the key
    /// is absent
    pub fn iter_from(&self, key: &[u8]) -> Result<Cursor<'_>> {
        self.check_key(key)?;
        let mut page_id = *self.root.read();
        loop {
            let guard = self.pool.get_page_read(page_id)?;
            if page::is_leaf(guard.data()) {
                let (found, pos) = LeafPage::new(guard.data()).find(key, self.cmp.as_ref());
                drop(guard);
                if !found {
                    return Ok(Cursor::end(self.pool.as_ref()));
                }
                return Cursor::at(self.pool.as_ref(), page_id, pos);
            }
            let internal = InternalPage::new(guard.data());
            page_id = internal.child_at(internal.find_child(key, self.cmp.as_ref()));
        }
    }

    /// The past-the-end cursor
    pub fn end(&self) -> Cursor<'_> {
        Cursor::end(self.pool.as_ref())
    }

    /// Number of levels from the root down to the leaves
    pub fn height(&self) -> Result<usize> {
        let root = self.root.read();
        let mut page_id = *root;
        let mut height = 1;
        loop {
            let guard = self.pool.get_page(page_id)?;
            let data = guard.read();
            if page::is_leaf(&data) {
                return Ok(height);
            }
            page_id = InternalPage::new(&*data).child_at(0);
            height += 1;
        }
    }

    /// Snapshot the tree structure for inspection
    pub fn export(&self) -> Result<TreeExport> {
        let root = self.root.read();
        self.export_node(*root)
    }

    fn export_node(&self, page_id: PageId) -> Result<TreeExport> {
        let guard = self.pool.get_page(page_id)?;
        let (is_leaf, keys, child_ids) = {
            let data = guard.read();
            if page::is_leaf(&data) {
                let leaf = LeafPage::new(&*data);
                let keys = (0..leaf.size()).map(|i| leaf.key_at(i).to_vec()).collect();
                (true, keys, Vec::new())
            } else {
                let internal = InternalPage::new(&*data);
                let keys = (1..=internal.size())
                    .map(|i| internal.key_at(i).to_vec())
                    .collect();
                let child_ids = (0..=internal.size()).map(|i| internal.child_at(i)).collect();
                (false, keys, child_ids)
            }
        };
        drop(guard);

        let mut children = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            children.push(self.export_node(child_id)?);
        }
        Ok(TreeExport {
            page_id: page_id.value(),
            is_leaf,
            keys,
            children,
        })
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

    /// Descend through slot-0 children down to the first leaf
    fn first_leaf_id(&self, mut page_id: PageId) -> Result<PageId> {
        loop {
            let guard = self.pool.get_page(page_id)?;
            let data = guard.read();
            if page::is_leaf(&data) {
                return Ok(page_id);
            }
            page_id = InternalPage::new(&*data).child_at(0);
        }
    }

    /// First key of the leftmost leaf under a subtree; used to synthesize
    /// separators
    fn first_leaf_key(&self, page_id: PageId) -> Result<Vec<u8>> {
        let leaf_id = self.first_leaf_id(page_id)?;
        let guard = self.pool.get_page(leaf_id)?;
        let data = guard.read();
        Ok(LeafPage::new(&*data).key_at(0).to_vec())
    }

    /// First key stored on a page of either kind; for a fresh right
    /// sibling this is the separator to publish in the parent
    fn first_key_of(&self, page_id: PageId) -> Result<Vec<u8>> {
        let guard = self.pool.get_page(page_id)?;
        let data = guard.read();
        let key = if page::is_leaf(&data) {
            LeafPage::new(&*data).key_at(0).to_vec()
        } else {
            InternalPage::new(&*data).key_at(0).to_vec()
        };
        Ok(key)
    }

    fn insert_rec(&self, page_id: PageId, key: &[u8], rid: RecordId) -> Result<InsertOutcome> {
        let mut guard = self.pool.get_page(page_id)?;
        let child_id = {
            let data = guard.read();
            let internal = InternalPage::new(&*data);
            internal.child_at(internal.find_child(key, self.cmp.as_ref()))
        };

        let child_outcome = {
            let mut child_guard = self.pool.get_page(child_id)?;
            if page::is_leaf(&child_guard.read()) {
                self.insert_into_leaf(&mut child_guard, key, rid)?
            } else {
                drop(child_guard);
                self.insert_rec(child_id, key, rid)?
            }
        };

        match child_outcome {
            InsertOutcome::Split(right_id) => {
                let separator = self.first_key_of(right_id)?;
                self.insert_child_link(&mut guard, &separator, right_id)
            }
            other => Ok(other),
        }
    }

    /// Link a freshly split-off child under its separator, splitting this
    /// internal page when it is full
    fn insert_child_link(
        &self,
        guard: &mut PageGuard<'_>,
        separator: &[u8],
        child: PageId,
    ) -> Result<InsertOutcome> {
        let full = InternalPage::new(&*guard.read()).is_full();
        if !full {
            let mut data = guard.write();
            InternalPage::new(&mut *data).insert(separator, child, self.cmp.as_ref());
            return Ok(InsertOutcome::Inserted);
        }

        let mut right_guard = self.pool.next_free_page()?;
        let right_id = right_guard.page_id();
        {
            let mut left_data = guard.write();
            let mut right_data = right_guard.write();
            let mut left = InternalPage::new(&mut *left_data);
            let mut right = InternalPage::new(&mut *right_data);
            right.init(self.key_size, self.internal_max);

            let mid = left.size() / 2;
            right.take_from(&left, mid + 1);
            left.set_size(mid);

            if self.cmp.compare(separator, right.key_at(0)) == Ordering::Less {
                left.insert(separator, child, self.cmp.as_ref());
            } else {
                right.insert(separator, child, self.cmp.as_ref());
            }
        }
        debug!("internal page {} split into {}", guard.page_id(), right_id);
        Ok(InsertOutcome::Split(right_id))
    }

    fn insert_into_leaf(
        &self,
        guard: &mut PageGuard<'_>,
        key: &[u8],
        rid: RecordId,
    ) -> Result<InsertOutcome> {
        let (found, pos, full) = {
            let data = guard.read();
            let leaf = LeafPage::new(&*data);
            let (found, pos) = leaf.find(key, self.cmp.as_ref());
            (found, pos, leaf.is_full())
        };
        if found {
            return Ok(InsertOutcome::Duplicate);
        }
        if !full {
            let mut data = guard.write();
            LeafPage::new(&mut *data).insert_at(pos, key, rid);
            return Ok(InsertOutcome::Inserted);
        }

        // split in the middle, then place the new key on whichever side
        // its ordering dictates
        let mut right_guard = self.pool.next_free_page()?;
        let right_id = right_guard.page_id();
        {
            let mut left_data = guard.write();
            let mut right_data = right_guard.write();
            let mut left = LeafPage::new(&mut *left_data);
            let mut right = LeafPage::new(&mut *right_data);
            right.init(self.key_size, self.leaf_max);

            let size = left.size();
            let mid = size / 2;
            let insert_left = self.cmp.compare(key, left.key_at(mid)) == Ordering::Less;
            if insert_left {
                right.take_from(&left, mid);
                left.set_size(mid);
                left.insert(key, rid, self.cmp.as_ref());
            } else if size == 2 {
                right.take_from(&left, 1);
                left.set_size(1);
                right.insert(key, rid, self.cmp.as_ref());
            } else {
                right.take_from(&left, mid + 1);
                left.set_size(mid + 1);
                right.insert(key, rid, self.cmp.as_ref());
            }

            // splice the new leaf into the chain
            let next = left.next_page_id();
            left.set_next_page_id(right_id);
            right.set_next_page_id(next);
        }
        debug!("leaf page {} split into {}", guard.page_id(), right_id);
        Ok(InsertOutcome::Split(right_id))
    }

    /// Remove `key` from the subtree below the internal page `page_id`,
    /// rebalancing children on the way back up
    fn remove_rec(
        &self,
        root_id: PageId,
        page_id: PageId,
        key: &[u8],
        dropped: &mut Vec<PageId>,
    ) -> Result<bool> {
        let mut parent_guard = self.pool.get_page(page_id)?;
        let (pos, child_id) = {
            let data = parent_guard.read();
            let parent = InternalPage::new(&*data);
            let pos = parent.find_child(key, self.cmp.as_ref());
            (pos, parent.child_at(pos))
        };

        let mut child_guard = self.pool.get_page(child_id)?;
        if page::is_leaf(&child_guard.read()) {
            let (found, kpos) = {
                let data = child_guard.read();
                LeafPage::new(&*data).find(key, self.cmp.as_ref())
            };
            if !found {
                return Ok(false);
            }
            {
                let mut data = child_guard.write();
                LeafPage::new(&mut *data).remove_at(kpos);
            }
            let (child_size, child_next) = {
                let data = child_guard.read();
                let leaf = LeafPage::new(&*data);
                (leaf.size(), leaf.next_page_id())
            };

            if child_size == 0 {
                // unlink the emptied leaf from the chain, then drop its
                // slot in the parent
                if pos > 0 {
                    let left_id = {
                        let data = parent_guard.read();
                        InternalPage::new(&*data).child_at(pos - 1)
                    };
                    let mut left_guard = self.pool.get_page(left_id)?;
                    let mut data = left_guard.write();
                    LeafPage::new(&mut *data).set_next_page_id(child_next);
                } else {
                    self.unlink_from_chain(root_id, child_id, child_next)?;
                }
                {
                    let mut data = parent_guard.write();
                    InternalPage::new(&mut *data).remove_at(pos);
                }
                dropped.push(child_id);
                debug!("emptied leaf {} unlinked", child_id);
                return Ok(true);
            }

            if kpos == 0 {
                // the leaf's smallest key changed; refresh the separator
                let first = {
                    let data = child_guard.read();
                    LeafPage::new(&*data).key_at(0).to_vec()
                };
                let mut data = parent_guard.write();
                InternalPage::new(&mut *data).update_key_at(pos, &first);
            }

            if child_size <= self.leaf_max / 2 {
                let parent_size = {
                    let data = parent_guard.read();
                    InternalPage::new(&*data).size()
                };
                if pos + 1 <= parent_size {
                    let right_id = {
                        let data = parent_guard.read();
                        InternalPage::new(&*data).child_at(pos + 1)
                    };
                    let right_guard = self.pool.get_page(right_id)?;
                    let right_size = {
                        let data = right_guard.read();
                        LeafPage::new(&*data).size()
                    };
                    if right_size <= self.leaf_max / 2 {
                        {
                            let mut child_data = child_guard.write();
                            let right_data = right_guard.read();
                            LeafPage::new(&mut *child_data)
                                .merge_from_right(&LeafPage::new(&*right_data));
                        }
                        {
                            let mut data = parent_guard.write();
                            InternalPage::new(&mut *data).remove_at(pos + 1);
                        }
                        dropped.push(right_id);
                        debug!("leaf {} merged into {}", right_id, child_id);
                        return Ok(true);
                    }
                }
                if pos > 0 {
                    let left_id = {
                        let data = parent_guard.read();
                        InternalPage::new(&*data).child_at(pos - 1)
                    };
                    let mut left_guard = self.pool.get_page(left_id)?;
                    let left_size = {
                        let data = left_guard.read();
                        LeafPage::new(&*data).size()
                    };
                    if left_size <= self.leaf_max / 2 {
                        {
                            let mut left_data = left_guard.write();
                            let child_data = child_guard.read();
                            LeafPage::new(&mut *left_data)
                                .merge_from_right(&LeafPage::new(&*child_data));
                        }
                        {
                            let mut data = parent_guard.write();
                            InternalPage::new(&mut *data).remove_at(pos);
                        }
                        dropped.push(child_id);
                        debug!("leaf {} merged into {}", child_id, left_id);
                        return Ok(true);
                    }
                }
            }
            Ok(true)
        } else {
            drop(child_guard);
            if !self.remove_rec(root_id, child_id, key, dropped)? {
                return Ok(false);
            }

            let mut child_guard = self.pool.get_page(child_id)?;
            let child_size = {
                let data = child_guard.read();
                InternalPage::new(&*data).size()
            };
            if child_size >= self.internal_max / 2 {
                return Ok(true);
            }

            let parent_size = {
                let data = parent_guard.read();
                InternalPage::new(&*data).size()
            };
            if pos + 1 <= parent_size {
                let right_id = {
                    let data = parent_guard.read();
                    InternalPage::new(&*data).child_at(pos + 1)
                };
                let mut right_guard = self.pool.get_page(right_id)?;
                let right_size = {
                    let data = right_guard.read();
                    InternalPage::new(&*data).size()
                };
                if child_size + right_size < self.internal_max {
                    // the separator at the merge boundary is the lowest
                    // key of the right subtree's leftmost leaf
                    let separator = self.first_leaf_key(right_id)?;
                    {
                        let mut child_data = child_guard.write();
                        let right_data = right_guard.read();
                        InternalPage::new(&mut *child_data)
                            .merge_from_right(&InternalPage::new(&*right_data), &separator);
                    }
                    {
                        let mut data = parent_guard.write();
                        InternalPage::new(&mut *data).remove_at(pos + 1);
                    }
                    dropped.push(right_id);
                    debug!("internal {} merged into {}", right_id, child_id);
                    return Ok(true);
                }
                let need = self.internal_max / 2 - child_size;
                if need < right_size && need <= self.internal_max / 2 {
                    let separator = self.first_leaf_key(right_id)?;
                    {
                        let mut child_data = child_guard.write();
                        let mut right_data = right_guard.write();
                        InternalPage::new(&mut *child_data).move_from_right(
                            &mut InternalPage::new(&mut *right_data),
                            need,
                            &separator,
                        );
                    }
                    let new_separator = self.first_leaf_key(right_id)?;
                    let mut data = parent_guard.write();
                    InternalPage::new(&mut *data).update_key_at(pos + 1, &new_separator);
                    return Ok(true);
                }
            }
            if pos > 0 {
                let left_id = {
                    let data = parent_guard.read();
                    InternalPage::new(&*data).child_at(pos - 1)
                };
                let mut left_guard = self.pool.get_page(left_id)?;
                let left_size = {
                    let data = left_guard.read();
                    InternalPage::new(&*data).size()
                };
                if left_size + child_size < self.internal_max {
                    let separator = self.first_leaf_key(child_id)?;
                    {
                        let mut left_data = left_guard.write();
                        let child_data = child_guard.read();
                        InternalPage::new(&mut *left_data)
                            .merge_from_right(&InternalPage::new(&*child_data), &separator);
                    }
                    {
                        let mut data = parent_guard.write();
                        InternalPage::new(&mut *data).remove_at(pos);
                    }
                    dropped.push(child_id);
                    debug!("internal {} merged into {}", child_id, left_id);
                    return Ok(true);
                }
                let need = self.internal_max / 2 - child_size;
                if need < left_size && need <= self.internal_max / 2 {
                    let separator = self.first_leaf_key(child_id)?;
                    {
                        let mut child_data = child_guard.write();
                        let mut left_data = left_guard.write();
                        InternalPage::new(&mut *child_data).move_from_left(
                            &mut InternalPage::new(&mut *left_data),
                            need,
                            &separator,
                        );
                    }
                    let new_separator = self.first_leaf_key(child_id)?;
                    let mut data = parent_guard.write();
                    InternalPage::new(&mut *data).update_key_at(pos, &new_separator);
                    return Ok(true);
                }
            }
            Ok(true)
        }
    }

    /// Patch the predecessor of an emptied leaf that is the leftmost child
    /// of its parent; the predecessor, if any, is found by walking the
    /// chain from the tree's leftmost leaf
    fn unlink_from_chain(
        &self,
        root_id: PageId,
        child_id: PageId,
        child_next: PageId,
    ) -> Result<()> {
        let mut page_id = self.first_leaf_id(root_id)?;
        if page_id == child_id {
            return Ok(());
        }
        loop {
            let mut guard = self.pool.get_page(page_id)?;
            let next = {
                let data = guard.read();
                LeafPage::new(&*data).next_page_id()
            };
            if next == child_id {
                let mut data = guard.write();
                LeafPage::new(&mut *data).set_next_page_id(child_next);
                return Ok(());
            }
            if !next.is_valid() {
                return Ok(());
            }
            page_id = next;
        }
    }

    fn release_dropped(&self, dropped: &mut Vec<PageId>) {
        for page_id in dropped.drain(..) {
            if !self.pool.give_back_page(page_id) {
                warn!("failed to give back page {}", page_id);
            }
        }
    }
}
