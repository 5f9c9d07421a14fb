//! Page: a fixed-size byte buffer behind a reader/writer latch.

use crate::types::PAGE_SIZE;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A raw page buffer
pub struct PageBuf {
    data: [u8; PAGE_SIZE],
}

impl PageBuf {
    /// Create a new zeroed page buffer
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Get a reference to the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get a mutable reference to the raw bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl AsRef<[u8]> for PageBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for PageBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A single page of the pool: its byte buffer and the reader/writer latch
/// protecting it.
///
/// Bookkeeping (page id, pin count, dirty flag) lives with the pool, behind
/// the pool's single lock; the latch here only protects the page contents.
/// The buffer is zeroed once at pool construction and is otherwise left to
/// the caller to initialize on allocation.
pub struct Page {
    latch: RwLock<PageBuf>,
}

impl Page {
    pub(crate) fn new() -> Self {
        Self {
            latch: RwLock::new(PageBuf::new()),
        }
    }

    /// Acquire the page read latch
    pub(crate) fn read_latch(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.latch.read()
    }

    /// Acquire the page write latch
    pub(crate) fn write_latch(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.latch.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_buf_starts_zeroed() {
        let buf = PageBuf::new();
        assert_eq!(buf.len(), PAGE_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_latch_allows_parallel_readers() {
        let page = Page::new();
        let r1 = page.read_latch();
        let r2 = page.read_latch();
        assert_eq!(r1[0], r2[0]);
    }

    #[test]
    fn test_page_buffer_mutation() {
        let page = Page::new();
        {
            let mut w = page.write_latch();
            w[0] = 0xab;
        }
        assert_eq!(page.read_latch()[0], 0xab);
    }
}
