//! The commit graph and its head set.
//!
//! The graph persists every commit through the KV substrate and tracks
//! the current heads: commits with no known children. In steady state a
//! page has exactly one head; more than one signals unresolved divergence
//! that the merge resolver must collapse.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::commit::{Commit, CommitId};
use crate::error::{Error, Result};
use crate::store::{PageDb, WriteBatch};
use crate::tree::PageTree;

const COMMIT_PREFIX: &[u8] = b"commit/";
const HEAD_PREFIX: &[u8] = b"head/";
const GENESIS_KEY: &[u8] = b"meta/genesis";

fn commit_key(id: &CommitId) -> Vec<u8> {
    let mut key = Vec::with_capacity(COMMIT_PREFIX.len() + 32);
    key.extend_from_slice(COMMIT_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

fn head_key(id: &CommitId) -> Vec<u8> {
    let mut key = Vec::with_capacity(HEAD_PREFIX.len() + 32);
    key.extend_from_slice(HEAD_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

/// The DAG of commits for one page.
pub struct CommitGraph {
    db: Arc<dyn PageDb>,
    /// Current heads with their timestamps. Mutated only under the lock
    /// so a concurrent insert can never lose a head.
    heads: Mutex<BTreeMap<CommitId, i64>>,
    genesis: CommitId,
}

impl CommitGraph {
    /// Open the graph for a page, creating the genesis commit if the page
    /// is new.
    pub async fn open(db: Arc<dyn PageDb>, objects: &crate::store::ObjectStore) -> Result<Self> {
        let genesis = match db.get(GENESIS_KEY).await? {
            Some(bytes) => CommitId::from_slice(&bytes)?,
            None => {
                let empty_root = PageTree::new().store(objects).await?;
                let genesis = Commit::genesis(empty_root);
                let id = genesis.id();
                let mut batch = WriteBatch::new();
                batch.put(commit_key(&id), genesis.to_bytes()?);
                batch.put(head_key(&id), genesis.timestamp.to_le_bytes().to_vec());
                batch.put(GENESIS_KEY.to_vec(), id.as_bytes().to_vec());
                db.apply_batch(batch).await?;
                debug!(commit = %id, "created genesis commit");
                id
            }
        };

        let mut heads = BTreeMap::new();
        for (key, value) in db.scan_prefix(HEAD_PREFIX).await? {
            let id = CommitId::from_slice(&key[HEAD_PREFIX.len()..])?;
            let timestamp = i64::from_le_bytes(
                value[..]
                    .try_into()
                    .map_err(|_| Error::Storage("Bad head timestamp".to_string()))?,
            );
            heads.insert(id, timestamp);
        }

        Ok(Self {
            db,
            heads: Mutex::new(heads),
            genesis,
        })
    }

    /// Id of the genesis commit.
    pub fn genesis(&self) -> CommitId {
        self.genesis
    }

    /// Load a commit by id.
    pub async fn get_commit(&self, id: &CommitId) -> Result<Commit> {
        let bytes = self
            .db
            .get(&commit_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("Commit {}", id)))?;
        Commit::from_bytes(&bytes)
    }

    /// Whether a commit is present locally.
    pub async fn contains(&self, id: &CommitId) -> Result<bool> {
        Ok(self.db.get(&commit_key(id)).await?.is_some())
    }

    /// Current heads ordered by (timestamp, id).
    pub async fn heads(&self) -> Vec<(CommitId, i64)> {
        let heads = self.heads.lock().await;
        let mut out: Vec<(CommitId, i64)> = heads.iter().map(|(id, ts)| (*id, *ts)).collect();
        out.sort_by_key(|(id, ts)| (*ts, *id));
        out
    }

    /// Number of current heads.
    pub async fn head_count(&self) -> usize {
        self.heads.lock().await.len()
    }

    /// Insert a commit, updating the head set atomically: parents present
    /// in the head set are removed and the new commit becomes a head
    /// (unless it already has known children, which cannot happen through
    /// this interface since children are inserted after their parents).
    ///
    /// All parents must already be present locally; a missing parent is a
    /// `NotFound` error and the caller is expected to fetch the ancestor
    /// first. Re-inserting an existing commit is a no-op.
    pub async fn insert_commit(&self, commit: &Commit) -> Result<CommitId> {
        let id = commit.id();
        let mut heads = self.heads.lock().await;

        if self.db.get(&commit_key(&id)).await?.is_some() {
            return Ok(id);
        }
        for parent in &commit.parents {
            if self.db.get(&commit_key(parent)).await?.is_none() {
                return Err(Error::NotFound(format!(
                    "Parent commit {} of {}",
                    parent, id
                )));
            }
        }

        let mut batch = WriteBatch::new();
        batch.put(commit_key(&id), commit.to_bytes()?);
        for parent in &commit.parents {
            if heads.contains_key(parent) {
                batch.delete(head_key(parent));
            }
        }
        batch.put(head_key(&id), commit.timestamp.to_le_bytes().to_vec());
        self.db.apply_batch(batch).await?;

        for parent in &commit.parents {
            heads.remove(parent);
        }
        heads.insert(id, commit.timestamp);
        debug!(commit = %id, heads = heads.len(), "inserted commit");
        Ok(id)
    }

    /// All ancestors of a commit (excluding the commit itself).
    pub async fn ancestors(&self, id: &CommitId) -> Result<BTreeSet<CommitId>> {
        let mut seen = BTreeSet::new();
        let mut queue = vec![*id];
        while let Some(current) = queue.pop() {
            let commit = self.get_commit(&current).await?;
            for parent in &commit.parents {
                if seen.insert(*parent) {
                    queue.push(*parent);
                }
            }
        }
        Ok(seen)
    }

    /// Greatest common ancestor of two commits: the common ancestor with
    /// the highest (timestamp, id). Always exists because every history
    /// shares the genesis commit.
    pub async fn common_ancestor(&self, a: &CommitId, b: &CommitId) -> Result<CommitId> {
        if a == b {
            return Ok(*a);
        }
        let ancestors_of_a: HashSet<CommitId> = {
            let mut set: HashSet<CommitId> = self.ancestors(a).await?.into_iter().collect();
            set.insert(*a);
            set
        };
        if ancestors_of_a.contains(b) {
            return Ok(*b);
        }

        // Walk up from b in decreasing (timestamp, id) order; the first
        // commit also reachable from a is the greatest common ancestor.
        let mut heap: BinaryHeap<(i64, CommitId)> = BinaryHeap::new();
        let mut visited: HashSet<CommitId> = HashSet::new();
        let start = self.get_commit(b).await?;
        heap.push((start.timestamp, *b));
        visited.insert(*b);
        while let Some((_, current)) = heap.pop() {
            if current != *b && ancestors_of_a.contains(&current) {
                return Ok(current);
            }
            let commit = self.get_commit(&current).await?;
            for parent in &commit.parents {
                if visited.insert(*parent) {
                    let parent_commit = self.get_commit(parent).await?;
                    heap.push((parent_commit.timestamp, *parent));
                }
            }
        }
        Err(Error::Internal(format!(
            "Commits {} and {} share no ancestor",
            a, b
        )))
    }
}
