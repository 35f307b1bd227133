//! The key/value tree a commit's root object points at.
//!
//! Keys are sorted for deterministic serialization, so identical logical
//! content always stores under the same digest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::object::{ObjectDigest, ObjectPriority};
use crate::store::ObjectStore;

/// One value in a page's key/value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Root object holding the value bytes.
    pub object: ObjectDigest,
    /// Sync priority of the referenced object.
    pub priority: ObjectPriority,
}

/// Snapshot of a page's key/value space at one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTree {
    entries: BTreeMap<Vec<u8>, TreeEntry>,
}

impl PageTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&TreeEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: Vec<u8>, entry: TreeEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<TreeEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &TreeEntry)> {
        self.entries.iter()
    }

    /// Keys present in either tree.
    pub fn key_union<'a>(&'a self, other: &'a PageTree) -> Vec<&'a [u8]> {
        let mut keys: Vec<&[u8]> = self.entries.keys().map(|k| k.as_slice()).collect();
        for k in other.entries.keys() {
            if !self.entries.contains_key(k) {
                keys.push(k.as_slice());
            }
        }
        keys.sort_unstable();
        keys
    }

    /// Serialize to binary format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Internal(format!("Serialize tree: {}", e)))
    }

    /// Deserialize from binary format.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| Error::InvalidArgument(format!("Bad tree encoding: {}", e)))
    }

    /// Persist this tree through the object store, returning the root
    /// digest. Identical trees dedup to the same root.
    pub async fn store(&self, objects: &ObjectStore) -> Result<ObjectDigest> {
        objects.new_piece(&self.to_bytes()?).await
    }

    /// Load a tree from its root digest.
    pub async fn load(objects: &ObjectStore, root: &ObjectDigest) -> Result<Self> {
        let data = objects.read(root).await?;
        Self::from_bytes(&data)
    }
}
