//! # page-store
//!
//! The core of a page-based storage engine: a fixed pool of equally sized
//! in-memory pages and two concurrent index structures built on top of
//! it, a B+ tree (ordered, range-scannable) and an extendible hash table
//! (unordered, point lookups). Both map opaque fixed-width binary keys to
//! record ids and keep all of their state in laid-out page bytes.
//!
//! ## Architecture
//!
//! - **Pool** (`pool`): page allocation, pin accounting, and RAII guards
//!   with reader/writer latching
//! - **B+ tree** (`btree`): typed leaf/internal page views, split/merge
//!   algorithms, and a leaf-chain cursor
//! - **Hash table** (`hash`): header/directory/bucket page views and
//!   directory growth driven by local/global depth
//!
//! ## Usage
//!
//! ```rust,ignore
//! use page_store::{BPlusTree, PagePool, RecordId, SliceKeyCompare};
//! use std::sync::Arc;
//!
//! let pool = Arc::new(PagePool::new(1024));
//! let tree = BPlusTree::new(pool, Box::new(SliceKeyCompare), 8, 0, 0)?;
//! tree.insert(b"\x01\0\0\0\0\0\0\0", RecordId::default())?;
//! for rid in tree.iter()? {
//!     println!("{rid}");
//! }
//! ```
//!
//! There is no durability layer: the pages live entirely in the pool and
//! vanish with it.

pub mod btree;
pub mod error;
pub mod hash;
pub mod key;
pub mod pool;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Result, StorageError};
pub use types::{PageId, RecordId, SlotId, PAGE_SIZE};

// Re-export main public API
pub use btree::{BPlusTree, Cursor, TreeExport};
pub use hash::ExtendibleHashTable;
pub use key::{FnvKeyHash, KeyCompare, KeyHash, SliceKeyCompare};
pub use pool::{PageGuard, PagePool, PoolStats, ReadPageGuard, WritePageGuard};
