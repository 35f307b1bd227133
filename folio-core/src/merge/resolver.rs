//! Per-page merge resolution.
//!
//! The resolver watches a page's head set; whenever more than one head
//! exists it selects exactly two, computes their greatest common
//! ancestor, and dispatches the active strategy. With more than two
//! heads, repeated pairwise merges converge to a single head.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::commit::CommitId;
use crate::error::{Error, Result};
use crate::graph::CommitGraph;
use crate::journal::Journal;
use crate::merge::strategy::{MergeInput, MergeStrategy};
use crate::page::PageId;
use crate::store::ObjectStore;
use crate::tree::PageTree;

/// Resolver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Idle,
    ResolvingPair,
    Cancelled,
}

/// What one resolution attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// At most one head existed; nothing to do.
    Nothing,
    /// Two heads were merged into the returned commit.
    Merged(CommitId),
    /// The merge was cancelled before its result was applied.
    Cancelled,
}

type OnErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;

/// Merge resolver for a single page.
///
/// Held in a [`super::MergeManager`] registry; references its page by id
/// only.
pub struct PageMergeResolver {
    page: PageId,
    graph: Arc<CommitGraph>,
    objects: Arc<ObjectStore>,
    strategy: RwLock<Arc<dyn MergeStrategy>>,
    state: Mutex<ResolverState>,
    cancelled: AtomicBool,
    on_error: Mutex<Option<OnErrorCallback>>,
}

impl PageMergeResolver {
    pub fn new(
        page: PageId,
        graph: Arc<CommitGraph>,
        objects: Arc<ObjectStore>,
        strategy: Arc<dyn MergeStrategy>,
    ) -> Self {
        Self {
            page,
            graph,
            objects,
            strategy: RwLock::new(strategy),
            state: Mutex::new(ResolverState::Idle),
            cancelled: AtomicBool::new(false),
            on_error: Mutex::new(None),
        }
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn state(&self) -> ResolverState {
        *self.state.lock().expect("resolver state lock poisoned")
    }

    fn set_state(&self, state: ResolverState) {
        *self.state.lock().expect("resolver state lock poisoned") = state;
    }

    /// Swap the active strategy. In-flight merges keep the strategy they
    /// started with; the new one applies from the next pair on.
    pub fn set_strategy(&self, strategy: Arc<dyn MergeStrategy>) {
        *self.strategy.write().expect("strategy lock poisoned") = strategy;
    }

    /// Register a callback invoked when a merge fails. The owner
    /// typically swaps the strategy here (e.g. when a custom resolver's
    /// connection drops) without losing the in-flight merge.
    pub fn set_on_error(&self, callback: OnErrorCallback) {
        *self.on_error.lock().expect("on_error lock poisoned") = Some(callback);
    }

    /// Cancel an in-flight merge. Effective only between the start of a
    /// resolution and the point its result would be applied; the merged
    /// commit is then discarded instead of written.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resolve one pair of heads, if the page has more than one.
    pub async fn merge_once(&self) -> Result<MergeOutcome> {
        let heads = self.graph.heads().await;
        if heads.len() < 2 {
            self.set_state(ResolverState::Idle);
            return Ok(MergeOutcome::Nothing);
        }
        self.cancelled.store(false, Ordering::SeqCst);
        self.set_state(ResolverState::ResolvingPair);

        // Heads are already ordered by (timestamp, id); the pair contract
        // left.timestamp <= right.timestamp holds by construction.
        let (left_id, _) = heads[0];
        let (right_id, _) = heads[1];
        let result = self.merge_pair(left_id, right_id).await;

        match result {
            Ok(Some(id)) => {
                self.set_state(ResolverState::Idle);
                debug!(page = %self.page, commit = %id, "merged head pair");
                Ok(MergeOutcome::Merged(id))
            }
            Ok(None) => {
                self.set_state(ResolverState::Cancelled);
                debug!(page = %self.page, "merge cancelled");
                Ok(MergeOutcome::Cancelled)
            }
            Err(e) => {
                self.set_state(ResolverState::Idle);
                warn!(page = %self.page, error = %e, "merge failed");
                if let Some(callback) = self.on_error.lock().expect("on_error lock poisoned").as_ref()
                {
                    callback(&e);
                }
                Err(e)
            }
        }
    }

    /// Merge pairs until a single head remains. Returns the number of
    /// merge commits created.
    pub async fn resolve_until_converged(&self) -> Result<usize> {
        let mut merges = 0;
        loop {
            match self.merge_once().await? {
                MergeOutcome::Merged(_) => merges += 1,
                MergeOutcome::Nothing | MergeOutcome::Cancelled => return Ok(merges),
            }
        }
    }

    async fn merge_pair(&self, left_id: CommitId, right_id: CommitId) -> Result<Option<CommitId>> {
        let ancestor_id = self.graph.common_ancestor(&left_id, &right_id).await?;
        let left_commit = self.graph.get_commit(&left_id).await?;
        let right_commit = self.graph.get_commit(&right_id).await?;
        let ancestor_commit = self.graph.get_commit(&ancestor_id).await?;

        let left_tree = PageTree::load(&self.objects, &left_commit.root).await?;
        let right_tree = PageTree::load(&self.objects, &right_commit.root).await?;
        let ancestor_tree = PageTree::load(&self.objects, &ancestor_commit.root).await?;

        let strategy = self
            .strategy
            .read()
            .expect("strategy lock poisoned")
            .clone();
        let merged = strategy
            .merge(&MergeInput {
                ancestor: &ancestor_tree,
                left: &left_tree,
                right: &right_tree,
                left_commit: &left_commit,
                right_commit: &right_commit,
            })
            .await?;

        // The cancellation window closes here: once the merge journal is
        // committed the result is durable.
        if self.cancelled.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }

        let mut journal =
            Journal::new_merge(self.graph.clone(), self.objects.clone(), left_id, right_id);
        for (key, entry) in merged.iter() {
            if left_tree.get(key) != Some(entry) {
                journal.put(key.clone(), entry.object, entry.priority)?;
            }
        }
        for (key, _) in left_tree.iter() {
            if merged.get(key).is_none() {
                journal.delete(key.clone())?;
            }
        }
        let id = journal.commit().await?;
        Ok(Some(id))
    }
}
