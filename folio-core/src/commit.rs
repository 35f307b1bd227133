//! Immutable commits.
//!
//! A commit snapshots a page's key/value tree (by root object digest) and
//! links to its parents, forming the history DAG. Commit ids are content
//! hashes of a canonical byte encoding, so the same logical content
//! always yields the same id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::object::ObjectDigest;

/// Content-derived identifier of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId([u8; 32]);

impl CommitId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::InvalidArgument(format!(
                "Commit id must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Immutable node in the history DAG.
///
/// Parents: the genesis commit has none, a regular commit has one, and a
/// merge commit has exactly two, ordered so that
/// `parents[0].timestamp <= parents[1].timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Parent commit ids (0 for genesis, 1 for regular, 2 for merges).
    pub parents: Vec<CommitId>,
    /// Root object of the key/value tree at this point in history.
    pub root: ObjectDigest,
    /// Commit timestamp (Unix milliseconds).
    pub timestamp: i64,
}

impl Commit {
    /// The genesis commit over an empty tree root. Every page history
    /// starts here, so all replicas share the same genesis id.
    pub fn genesis(root: ObjectDigest) -> Self {
        Self {
            parents: Vec::new(),
            root,
            timestamp: 0,
        }
    }

    /// A regular commit with a single parent.
    pub fn new_simple(parent: CommitId, root: ObjectDigest, timestamp: i64) -> Self {
        Self {
            parents: vec![parent],
            root,
            timestamp,
        }
    }

    /// A merge commit over two parents.
    ///
    /// Parent order is normalized internally: the parent with the smaller
    /// (timestamp, id) pair comes first, so the ordering invariant holds
    /// even under clock skew, with ties broken deterministically by id.
    pub fn new_merge(
        parent1: (CommitId, i64),
        parent2: (CommitId, i64),
        root: ObjectDigest,
        timestamp: i64,
    ) -> Self {
        let (first, second) = if (parent1.1, parent1.0) <= (parent2.1, parent2.0) {
            (parent1.0, parent2.0)
        } else {
            (parent2.0, parent1.0)
        };
        Self {
            parents: vec![first, second],
            root,
            timestamp,
        }
    }

    /// Compute the commit id from the canonical byte encoding.
    pub fn id(&self) -> CommitId {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update([self.parents.len() as u8]);
        for parent in &self.parents {
            hasher.update(parent.as_bytes());
        }
        hasher.update(self.root.as_bytes());
        CommitId(hasher.finalize().into())
    }

    /// Whether this is a merge commit.
    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }

    /// Serialize to binary format for storage and transfer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Internal(format!("Serialize commit: {}", e)))
    }

    /// Deserialize from binary format, validating the parent count.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let commit: Commit = bincode::deserialize(data)
            .map_err(|e| Error::InvalidArgument(format!("Bad commit encoding: {}", e)))?;
        if commit.parents.len() > 2 {
            return Err(Error::InvalidArgument(format!(
                "Commit has {} parents",
                commit.parents.len()
            )));
        }
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(byte: u8) -> ObjectDigest {
        ObjectDigest::new([byte; 32])
    }

    #[test]
    fn test_same_content_same_id() {
        let a = Commit::new_simple(CommitId::new([1; 32]), root(2), 1000);
        let b = Commit::new_simple(CommitId::new([1; 32]), root(2), 1000);
        assert_eq!(a.id(), b.id());

        let c = Commit::new_simple(CommitId::new([1; 32]), root(2), 1001);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_merge_parent_order_normalized() {
        let older = (CommitId::new([1; 32]), 100);
        let newer = (CommitId::new([2; 32]), 200);
        let a = Commit::new_merge(older, newer, root(3), 300);
        let b = Commit::new_merge(newer, older, root(3), 300);
        assert_eq!(a.parents, b.parents);
        assert_eq!(a.parents[0], older.0);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_merge_ties_broken_by_id() {
        let p1 = (CommitId::new([9; 32]), 100);
        let p2 = (CommitId::new([1; 32]), 100);
        let merge = Commit::new_merge(p1, p2, root(0), 200);
        assert_eq!(merge.parents[0], p2.0);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let commit = Commit::new_merge(
            (CommitId::new([1; 32]), 10),
            (CommitId::new([2; 32]), 20),
            root(3),
            30,
        );
        let bytes = commit.to_bytes().unwrap();
        let parsed = Commit::from_bytes(&bytes).unwrap();
        assert_eq!(commit, parsed);
        assert_eq!(commit.id(), parsed.id());
    }

    #[test]
    fn test_genesis_is_stable() {
        let a = Commit::genesis(root(0));
        let b = Commit::genesis(root(0));
        assert_eq!(a.id(), b.id());
        assert!(a.parents.is_empty());
        assert!(!a.is_merge());
    }
}
