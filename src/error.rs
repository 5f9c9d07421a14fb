//! Error types for the storage engine.

use crate::types::PageId;
use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
///
/// Recoverable index outcomes (duplicate key, absent key, table full) are
/// reported through `Ok(false)` / `Ok(None)` returns; only resource
/// exhaustion and contract violations surface as errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The pool has no free page left to hand out
    #[error("page pool exhausted: no free pages")]
    PoolExhausted,

    /// A page id outside the pool was passed in
    #[error("page id {0} is out of range")]
    InvalidPageId(PageId),

    /// The requested page is currently in the free list
    #[error("page {0} is not in use")]
    PageNotInUse(PageId),

    /// A configured node or bucket capacity does not fit the page size
    #[error("capacity {requested} does not fit a page (derived limit: {limit})")]
    InvalidCapacity { requested: usize, limit: usize },

    /// A key buffer of the wrong width was passed in
    #[error("key is {actual} bytes, index was built for {expected}")]
    InvalidKeySize { expected: usize, actual: usize },

    /// A depth parameter exceeds what the page layout can hold
    #[error("depth {requested} exceeds the page layout limit {limit}")]
    InvalidDepth { requested: u32, limit: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            StorageError::PoolExhausted.to_string(),
            "page pool exhausted: no free pages"
        );
        assert_eq!(
            StorageError::InvalidPageId(PageId::new(99)).to_string(),
            "page id 99 is out of range"
        );
        assert_eq!(
            StorageError::PageNotInUse(PageId::new(3)).to_string(),
            "page 3 is not in use"
        );
    }
}
