//! Pluggable merge strategies.
//!
//! A strategy resolves two divergent heads and their common ancestor
//! into a single merged tree. Three capabilities are provided: a per-key
//! three-way content merge, last-one-wins, and a client-supplied custom
//! resolver invoked only for genuinely conflicting keys.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::debug;

use crate::commit::Commit;
use crate::error::{Error, Result};
use crate::tree::{PageTree, TreeEntry};

/// Everything a strategy sees about one merge.
///
/// `left` is the older head and `right` the newer:
/// `left_commit.timestamp <= right_commit.timestamp` always holds (the
/// resolver normalizes the pair before dispatch).
pub struct MergeInput<'a> {
    pub ancestor: &'a PageTree,
    pub left: &'a PageTree,
    pub right: &'a PageTree,
    pub left_commit: &'a Commit,
    pub right_commit: &'a Commit,
}

/// Pluggable algorithm resolving two divergent heads into one tree.
#[async_trait]
pub trait MergeStrategy: Send + Sync {
    async fn merge(&self, input: &MergeInput<'_>) -> Result<PageTree>;
}

/// A key whose two sides both changed relative to the ancestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: Vec<u8>,
    pub ancestor: Option<TreeEntry>,
    pub left: Option<TreeEntry>,
    pub right: Option<TreeEntry>,
}

/// A resolved value for one conflicting key; `None` deletes the key.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub key: Vec<u8>,
    pub entry: Option<TreeEntry>,
}

/// Client-supplied conflict resolution callback.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflicts: Vec<Conflict>) -> Result<Vec<Resolution>>;
}

/// Per-key three-way merge. Returns the merged tree of all cleanly
/// resolvable keys and the list of remaining conflicts.
pub fn three_way(
    ancestor: &PageTree,
    left: &PageTree,
    right: &PageTree,
) -> (PageTree, Vec<Conflict>) {
    let mut keys: BTreeSet<&[u8]> = BTreeSet::new();
    for (k, _) in ancestor.iter() {
        keys.insert(k.as_slice());
    }
    for (k, _) in left.iter() {
        keys.insert(k.as_slice());
    }
    for (k, _) in right.iter() {
        keys.insert(k.as_slice());
    }

    let mut merged = PageTree::new();
    let mut conflicts = Vec::new();
    for key in keys {
        let a = ancestor.get(key).copied();
        let l = left.get(key).copied();
        let r = right.get(key).copied();
        let winner = if l == r {
            l
        } else if l == a {
            r
        } else if r == a {
            l
        } else {
            conflicts.push(Conflict {
                key: key.to_vec(),
                ancestor: a,
                left: l,
                right: r,
            });
            continue;
        };
        if let Some(entry) = winner {
            merged.insert(key.to_vec(), entry);
        }
    }
    (merged, conflicts)
}

/// Takes the newer head's tree wholesale.
#[derive(Debug, Default)]
pub struct LastOneWinsStrategy;

#[async_trait]
impl MergeStrategy for LastOneWinsStrategy {
    async fn merge(&self, input: &MergeInput<'_>) -> Result<PageTree> {
        Ok(input.right.clone())
    }
}

/// Three-way content merge; keys where both sides changed fall back to
/// the newer head's value.
#[derive(Debug, Default)]
pub struct ContentDiffStrategy;

#[async_trait]
impl MergeStrategy for ContentDiffStrategy {
    async fn merge(&self, input: &MergeInput<'_>) -> Result<PageTree> {
        let (mut merged, conflicts) = three_way(input.ancestor, input.left, input.right);
        for conflict in conflicts {
            debug!(
                key = %String::from_utf8_lossy(&conflict.key),
                "both sides changed, taking newer head"
            );
            if let Some(entry) = conflict.right {
                merged.insert(conflict.key, entry);
            }
        }
        Ok(merged)
    }
}

/// Three-way content merge that hands the remaining conflicts to a
/// client-supplied resolver.
pub struct CustomStrategy<R> {
    resolver: R,
}

impl<R: ConflictResolver> CustomStrategy<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl<R: ConflictResolver> MergeStrategy for CustomStrategy<R> {
    async fn merge(&self, input: &MergeInput<'_>) -> Result<PageTree> {
        let (mut merged, conflicts) = three_way(input.ancestor, input.left, input.right);
        if conflicts.is_empty() {
            return Ok(merged);
        }
        let expected: BTreeSet<Vec<u8>> = conflicts.iter().map(|c| c.key.clone()).collect();
        let resolutions = self.resolver.resolve(conflicts).await?;
        let mut resolved: BTreeSet<Vec<u8>> = BTreeSet::new();
        for resolution in resolutions {
            if !expected.contains(&resolution.key) {
                return Err(Error::InvalidArgument(format!(
                    "Resolver returned unexpected key {:?}",
                    String::from_utf8_lossy(&resolution.key)
                )));
            }
            resolved.insert(resolution.key.clone());
            if let Some(entry) = resolution.entry {
                merged.insert(resolution.key, entry);
            }
        }
        if resolved.len() != expected.len() {
            return Err(Error::InvalidArgument(format!(
                "Resolver left {} of {} conflicts unresolved",
                expected.len() - resolved.len(),
                expected.len()
            )));
        }
        Ok(merged)
    }
}
