//! Page pool: fixed in-memory page set, pin accounting, and guards.
//!
//! The pool hands out pinned page handles; reader/writer latching is
//! layered on top through the guard types.

mod guard;
mod page;
#[allow(clippy::module_inception)]
mod pool;

pub use guard::{PageGuard, PageMut, PageRef, ReadPageGuard, WritePageGuard};
pub use page::{Page, PageBuf};
pub use pool::{PagePool, PoolStats};
