//! Record identifier type.

use std::fmt;

use crate::types::{PageId, SlotId};

/// Size of a record identifier when laid out in a page: a 4-byte page id
/// followed by a 2-byte slot id.
pub const RID_SIZE: usize = 6;

/// Identifier of a record: the page it lives on and its slot within that
/// page.
///
/// Both indexes treat record identifiers as opaque values; nothing in this
/// crate ever dereferences one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RecordId {
    page_id: PageId,
    slot_id: SlotId,
}

impl RecordId {
    /// Create a record identifier for the given page and slot
    pub const fn new(page_id: PageId, slot_id: SlotId) -> Self {
        Self { page_id, slot_id }
    }

    /// The page component
    pub const fn page_id(self) -> PageId {
        self.page_id
    }

    /// The slot component
    pub const fn slot_id(self) -> SlotId {
        self.slot_id
    }

    /// Lay the identifier out as it is stored in index pages
    pub fn to_bytes(self) -> [u8; RID_SIZE] {
        let mut buf = [0u8; RID_SIZE];
        buf[..4].copy_from_slice(&self.page_id.value().to_le_bytes());
        buf[4..].copy_from_slice(&self.slot_id.to_le_bytes());
        buf
    }

    /// Read an identifier back from its page layout
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let page_id = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let slot_id = u16::from_le_bytes([bytes[4], bytes[5]]);
        Self {
            page_id: PageId::new(page_id),
            slot_id,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot_id)
    }
}
