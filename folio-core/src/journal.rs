//! Journals: in-progress, uncommitted transactions against a page.
//!
//! A journal buffers put/delete operations against a base commit. On
//! commit it serializes the resulting key/value tree, persists the new
//! commit plus its root object, and registers the commit in the graph.
//! After commit or rollback the journal is invalid and every further
//! operation fails.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::commit::{Commit, CommitId};
use crate::error::{Error, Result};
use crate::graph::CommitGraph;
use crate::object::{ObjectDigest, ObjectPriority};
use crate::store::ObjectStore;
use crate::tree::{PageTree, TreeEntry};

/// Which kind of transaction this journal records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    /// Regular transaction with a single base parent.
    Simple { base: CommitId },
    /// Merge transaction; used only by the merge resolver. `base` is the
    /// older head, `other` the newer.
    Merge { base: CommitId, other: CommitId },
}

#[derive(Debug, Clone)]
enum PendingOp {
    Put(TreeEntry),
    Delete,
}

/// Mutable, transient transaction buffer.
pub struct Journal {
    kind: JournalKind,
    graph: Arc<CommitGraph>,
    objects: Arc<ObjectStore>,
    pending: BTreeMap<Vec<u8>, PendingOp>,
    valid: bool,
}

impl Journal {
    /// Start a regular transaction from a base commit.
    pub fn new_simple(graph: Arc<CommitGraph>, objects: Arc<ObjectStore>, base: CommitId) -> Self {
        Self {
            kind: JournalKind::Simple { base },
            graph,
            objects,
            pending: BTreeMap::new(),
            valid: true,
        }
    }

    /// Start a merge transaction. Only the merge resolver creates these;
    /// `base` must be the older of the two heads being merged.
    pub fn new_merge(
        graph: Arc<CommitGraph>,
        objects: Arc<ObjectStore>,
        base: CommitId,
        other: CommitId,
    ) -> Self {
        Self {
            kind: JournalKind::Merge { base, other },
            graph,
            objects,
            pending: BTreeMap::new(),
            valid: true,
        }
    }

    pub fn kind(&self) -> JournalKind {
        self.kind
    }

    fn check_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(Error::InvalidJournal)
        }
    }

    /// Buffer a put of `key` referencing an already-stored object.
    pub fn put(
        &mut self,
        key: impl Into<Vec<u8>>,
        object: ObjectDigest,
        priority: ObjectPriority,
    ) -> Result<()> {
        self.check_valid()?;
        self.pending
            .insert(key.into(), PendingOp::Put(TreeEntry { object, priority }));
        Ok(())
    }

    /// Store `value` as a blob and buffer a put referencing it.
    pub async fn put_bytes(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: &[u8],
        priority: ObjectPriority,
    ) -> Result<()> {
        self.check_valid()?;
        let object = self.objects.write_blob(value).await?;
        self.put(key, object, priority)
    }

    /// Buffer a delete of `key`.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.check_valid()?;
        self.pending.insert(key.into(), PendingOp::Delete);
        Ok(())
    }

    /// Commit the buffered operations, producing a new commit.
    ///
    /// The journal becomes invalid whether or not the commit succeeds
    /// past validation; a failed persist leaves the graph untouched.
    pub async fn commit(&mut self) -> Result<CommitId> {
        self.check_valid()?;
        self.valid = false;

        let (base, other) = match self.kind {
            JournalKind::Simple { base } => (base, None),
            JournalKind::Merge { base, other } => (base, Some(other)),
        };

        let base_commit = self.graph.get_commit(&base).await?;
        let mut tree = PageTree::load(&self.objects, &base_commit.root).await?;
        for (key, op) in &self.pending {
            match op {
                PendingOp::Put(entry) => tree.insert(key.clone(), *entry),
                PendingOp::Delete => {
                    tree.remove(key);
                }
            }
        }
        let root = tree.store(&self.objects).await?;
        let timestamp = chrono::Utc::now().timestamp_millis();

        let commit = match other {
            None => Commit::new_simple(base, root, timestamp),
            Some(other) => {
                let other_commit = self.graph.get_commit(&other).await?;
                Commit::new_merge(
                    (base, base_commit.timestamp),
                    (other, other_commit.timestamp),
                    root,
                    timestamp,
                )
            }
        };
        let id = self.graph.insert_commit(&commit).await?;
        debug!(commit = %id, ops = self.pending.len(), "journal committed");
        Ok(id)
    }

    /// Discard the buffered operations. The journal becomes invalid.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_valid()?;
        self.valid = false;
        self.pending.clear();
        Ok(())
    }
}
