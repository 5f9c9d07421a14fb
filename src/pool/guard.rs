//! RAII page guards.
//!
//! Every access to a pooled page goes through a guard that owns one pin
//! for its lifetime:
//!
//! - [`PageGuard`] owns a pin only. The page latch is taken transiently,
//!   per access, through [`PageGuard::read`] / [`PageGuard::write`].
//! - [`ReadPageGuard`] owns a pin and holds the page's read latch until
//!   dropped.
//! - [`WritePageGuard`] owns a pin and holds the page's write latch until
//!   dropped.
//!
//! Guards are move-only; dropping one releases the latch (if held) and
//! then the pin, carrying the dirty flag into the unpin. A pin-only guard
//! can be upgraded into a latched one with [`PageGuard::into_read`] /
//! [`PageGuard::into_write`], transferring the pin.

use std::mem::ManuallyDrop;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::pool::page::{Page, PageBuf};
use crate::pool::PagePool;
use crate::types::PageId;

/// A pinned page handle without a held latch
pub struct PageGuard<'a> {
    pool: &'a PagePool,
    page: &'a Page,
    page_id: PageId,
    is_dirty: bool,
}

impl<'a> PageGuard<'a> {
    pub(crate) fn new(pool: &'a PagePool, page: &'a Page, page_id: PageId) -> Self {
        Self {
            pool,
            page,
            page_id,
            is_dirty: false,
        }
    }

    /// Id of the guarded page
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Read the page contents under a transiently held read latch
    pub fn read(&self) -> PageRef<'_> {
        PageRef {
            latch: self.page.read_latch(),
        }
    }

    /// Mutate the page contents under a transiently held write latch;
    /// marks the guard dirty
    pub fn write(&mut self) -> PageMut<'_> {
        self.is_dirty = true;
        PageMut {
            latch: self.page.write_latch(),
        }
    }

    /// Upgrade into a guard holding the read latch, transferring the pin
    pub fn into_read(self) -> ReadPageGuard<'a> {
        let this = ManuallyDrop::new(self);
        ReadPageGuard {
            latch: this.page.read_latch(),
            guard: PageGuard {
                pool: this.pool,
                page: this.page,
                page_id: this.page_id,
                is_dirty: this.is_dirty,
            },
        }
    }

    /// Upgrade into a guard holding the write latch, transferring the pin
    pub fn into_write(self) -> WritePageGuard<'a> {
        let this = ManuallyDrop::new(self);
        WritePageGuard {
            latch: this.page.write_latch(),
            guard: PageGuard {
                pool: this.pool,
                page: this.page,
                page_id: this.page_id,
                is_dirty: this.is_dirty,
            },
        }
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.is_dirty);
    }
}

/// Shared view of a page's contents, valid while the read latch is held
pub struct PageRef<'a> {
    latch: RwLockReadGuard<'a, PageBuf>,
}

impl std::ops::Deref for PageRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.latch.as_bytes()
    }
}

/// Exclusive view of a page's contents, valid while the write latch is held
pub struct PageMut<'a> {
    latch: RwLockWriteGuard<'a, PageBuf>,
}

impl std::ops::Deref for PageMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.latch.as_bytes()
    }
}

impl std::ops::DerefMut for PageMut<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.latch.as_bytes_mut()
    }
}

/// A pinned page handle holding the page's read latch for its lifetime
pub struct ReadPageGuard<'a> {
    // field order matters: the latch must be released before the pin
    latch: RwLockReadGuard<'a, PageBuf>,
    guard: PageGuard<'a>,
}

impl ReadPageGuard<'_> {
    /// Id of the guarded page
    pub fn page_id(&self) -> PageId {
        self.guard.page_id
    }

    /// The page contents
    pub fn data(&self) -> &[u8] {
        self.latch.as_bytes()
    }
}

/// A pinned page handle holding the page's write latch for its lifetime
pub struct WritePageGuard<'a> {
    // field order matters: the latch must be released before the pin
    latch: RwLockWriteGuard<'a, PageBuf>,
    guard: PageGuard<'a>,
}

impl WritePageGuard<'_> {
    /// Id of the guarded page
    pub fn page_id(&self) -> PageId {
        self.guard.page_id
    }

    /// The page contents
    pub fn data(&self) -> &[u8] {
        self.latch.as_bytes()
    }

    /// The page contents, mutably; marks the guard dirty
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.guard.is_dirty = true;
        self.latch.as_bytes_mut()
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::PagePool;

    #[test]
    fn test_guard_pins_and_unpins() {
        let pool = PagePool::new(2);
        let guard = pool.next_free_page().unwrap();
        let id = guard.page_id();
        assert_eq!(pool.pin_count(id).unwrap(), 1);
        drop(guard);
        assert_eq!(pool.pin_count(id).unwrap(), 0);
    }

    #[test]
    fn test_write_marks_dirty() {
        let pool = PagePool::new(2);
        let mut guard = pool.next_free_page().unwrap();
        let id = guard.page_id();
        {
            let mut data = guard.write();
            data[0] = 1;
        }
        drop(guard);
        assert!(pool.is_dirty(id).unwrap());

        let guard = pool.get_page(id).unwrap();
        drop(guard);
        assert!(!pool.is_dirty(id).unwrap());
    }

    #[test]
    fn test_upgrade_transfers_pin() {
        let pool = PagePool::new(2);
        let guard = pool.next_free_page().unwrap();
        let id = guard.page_id();

        let read = guard.into_read();
        assert_eq!(pool.pin_count(id).unwrap(), 1);
        drop(read);
        assert_eq!(pool.pin_count(id).unwrap(), 0);

        let guard = pool.get_page(id).unwrap();
        let mut write = guard.into_write();
        write.data_mut()[0] = 7;
        assert_eq!(pool.pin_count(id).unwrap(), 1);
        drop(write);
        assert_eq!(pool.pin_count(id).unwrap(), 0);
    }

    #[test]
    fn test_read_guards_share_the_latch() {
        let pool = PagePool::new(2);
        let id = pool.next_free_page().unwrap().page_id();

        let r1 = pool.get_page_read(id).unwrap();
        let r2 = pool.get_page_read(id).unwrap();
        assert_eq!(r1.data()[0], r2.data()[0]);
        assert_eq!(pool.pin_count(id).unwrap(), 2);
    }
}
