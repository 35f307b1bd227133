//! Content-addressed object model.
//!
//! Objects are opaque byte blobs keyed by the SHA-256 digest of their
//! content. Leaf content is stored as a "piece"; blobs larger than one
//! chunk are described by a file index listing ordered (digest, size)
//! children, which allows partial and streamed reads.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Unique identifier for any stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectDigest([u8; 32]);

impl ObjectDigest {
    /// Create a new ObjectDigest from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the digest of a byte sequence.
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidArgument(format!("Bad digest hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Parse from a byte slice; the slice must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::InvalidArgument(format!(
                "Digest must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Sync priority of an object referenced by a page entry.
///
/// Eager objects are uploaded together with the commit that references
/// them; lazy objects are fetched from the remote on first local read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectPriority {
    Eager,
    Lazy,
}

/// Magic bytes for the file index binary format.
pub const INDEX_MAGIC: &[u8; 4] = b"FIDX";

/// File index format version.
pub const INDEX_VERSION: u16 = 1;

/// Fixed header size: magic(4) + version(2) + reserved(2).
pub const INDEX_HEADER_SIZE: usize = 8;

/// Fixed record size: digest(32) + size(8).
pub const INDEX_RECORD_SIZE: usize = 40;

/// One chunk reference inside a file index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexChild {
    pub digest: ObjectDigest,
    pub size: u64,
}

/// Describes a large blob as ordered (digest, size) chunks.
///
/// The serialized form is a fixed header followed by N fixed-size
/// records. The total size of the blob equals the sum of child sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIndex {
    children: Vec<IndexChild>,
}

impl FileIndex {
    /// Build an index over ordered children.
    pub fn new(children: Vec<IndexChild>) -> Self {
        Self { children }
    }

    /// Ordered chunk references.
    pub fn children(&self) -> &[IndexChild] {
        &self.children
    }

    /// Total blob size: the sum of all child sizes.
    pub fn total_size(&self) -> u64 {
        self.children.iter().map(|c| c.size).sum()
    }

    /// Serialize to the fixed binary layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INDEX_HEADER_SIZE + self.children.len() * INDEX_RECORD_SIZE);
        buf.extend_from_slice(INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&[0u8; 2]); // reserved
        for child in &self.children {
            buf.extend_from_slice(child.digest.as_bytes());
            buf.extend_from_slice(&child.size.to_le_bytes());
        }
        buf
    }

    /// Deserialize from the fixed binary layout.
    ///
    /// Rejects buffers shorter than the header, with a bad magic or
    /// version, or whose remainder is not a whole number of records.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "File index too short: {} bytes",
                data.len()
            )));
        }
        if &data[0..4] != INDEX_MAGIC {
            return Err(Error::InvalidArgument("Bad file index magic".to_string()));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != INDEX_VERSION {
            return Err(Error::InvalidArgument(format!(
                "Unsupported file index version: {}",
                version
            )));
        }
        let body = &data[INDEX_HEADER_SIZE..];
        if body.len() % INDEX_RECORD_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "File index body of {} bytes is not a whole number of records",
                body.len()
            )));
        }
        let mut children = Vec::with_capacity(body.len() / INDEX_RECORD_SIZE);
        for record in body.chunks_exact(INDEX_RECORD_SIZE) {
            let digest = ObjectDigest::from_slice(&record[0..32])?;
            let size = u64::from_le_bytes(
                record[32..40]
                    .try_into()
                    .map_err(|_| Error::Internal("Record slice length".to_string()))?,
            );
            children.push(IndexChild { digest, size });
        }
        Ok(Self { children })
    }

    /// Digest of the serialized index.
    pub fn digest(&self) -> ObjectDigest {
        ObjectDigest::from_data(&self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn child(byte: u8, size: u64) -> IndexChild {
        IndexChild {
            digest: ObjectDigest::new([byte; 32]),
            size,
        }
    }

    #[test]
    fn test_digest_is_deterministic() {
        let a = ObjectDigest::from_data(b"some bytes");
        let b = ObjectDigest::from_data(b"some bytes");
        assert_eq!(a, b);
        assert_ne!(a, ObjectDigest::from_data(b"other bytes"));
    }

    #[test]
    fn test_digest_hex_roundtrip() {
        let d = ObjectDigest::from_data(b"hello");
        let parsed = ObjectDigest::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn test_index_roundtrip_preserves_order_and_total() {
        let children = vec![child(1, 100), child(2, 50), child(3, 7)];
        let index = FileIndex::new(children.clone());
        let parsed = FileIndex::from_bytes(&index.to_bytes()).unwrap();
        assert_eq!(parsed.children(), &children[..]);
        assert_eq!(parsed.total_size(), 157);
    }

    #[test]
    fn test_index_empty() {
        let index = FileIndex::new(vec![]);
        let parsed = FileIndex::from_bytes(&index.to_bytes()).unwrap();
        assert!(parsed.children().is_empty());
        assert_eq!(parsed.total_size(), 0);
    }

    #[test]
    fn test_index_rejects_short_buffer() {
        let err = FileIndex::from_bytes(&[0u8; 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_index_rejects_bad_magic() {
        let mut data = FileIndex::new(vec![child(1, 1)]).to_bytes();
        data[0] = b'X';
        assert!(FileIndex::from_bytes(&data).is_err());
    }

    #[test]
    fn test_index_rejects_partial_record() {
        let mut data = FileIndex::new(vec![child(1, 1)]).to_bytes();
        data.truncate(data.len() - 1);
        let err = FileIndex::from_bytes(&data).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    proptest! {
        #[test]
        fn prop_index_roundtrip(sizes in proptest::collection::vec(0u64..1 << 40, 0..32)) {
            let children: Vec<IndexChild> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| child(i as u8, *s))
                .collect();
            let total: u64 = sizes.iter().sum();
            let index = FileIndex::new(children.clone());
            let parsed = FileIndex::from_bytes(&index.to_bytes()).unwrap();
            prop_assert_eq!(parsed.children(), &children[..]);
            prop_assert_eq!(parsed.total_size(), total);
        }
    }
}
