//! Page identifiers.
//!
//! A page is a single mutable key/value namespace with its own commit
//! history. Pages are grouped per application under a namespace string.

use serde::{Deserialize, Serialize};

/// Length of a page identifier in bytes.
pub const PAGE_ID_SIZE: usize = 16;

/// Fixed-size opaque identifier for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId([u8; PAGE_ID_SIZE]);

impl PageId {
    /// Create a new PageId from raw bytes.
    pub fn new(bytes: [u8; PAGE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice; the slice must be exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PAGE_ID_SIZE {
            return None;
        }
        let mut arr = [0u8; PAGE_ID_SIZE];
        arr.copy_from_slice(bytes);
        Some(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; PAGE_ID_SIZE] {
        &self.0
    }

    /// Convert to hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A (namespace, page) pair, the unit the eviction manager tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageRef {
    /// Per-application namespace.
    pub namespace: String,
    /// Page identifier within the namespace.
    pub page_id: PageId,
}

impl PageRef {
    pub fn new(namespace: impl Into<String>, page_id: PageId) -> Self {
        Self {
            namespace: namespace.into(),
            page_id,
        }
    }
}

impl std::fmt::Display for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.page_id)
    }
}
