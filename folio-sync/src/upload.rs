//! Upload half of the sync engine.
//!
//! Ships new local commits to the remote together with the eager
//! objects they newly reference. Upload blocks while the local view may
//! be behind the remote (catch-up download), while a remote commit
//! download is in flight, and while the page has more than one head.

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use folio_core::{
    Commit, CommitGraph, CommitId, Error, ObjectDigest, ObjectPriority, ObjectStore, PageDb,
    PageTree, Result, WriteBatch,
};

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::remote::{RemoteCommitRecord, RemoteStore, UploadBatch};
use crate::state::{DownloadSyncState, SyncStatePublisher, UploadSyncState};

const UPLOADED_COMMIT_PREFIX: &[u8] = b"sync/uploaded/";
const UPLOADED_OBJECT_PREFIX: &[u8] = b"sync/uploaded_obj/";

pub(crate) fn uploaded_commit_key(id: &CommitId) -> Vec<u8> {
    let mut key = UPLOADED_COMMIT_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

pub(crate) fn uploaded_object_key(digest: &ObjectDigest) -> Vec<u8> {
    let mut key = UPLOADED_OBJECT_PREFIX.to_vec();
    key.extend_from_slice(digest.as_bytes());
    key
}

/// What one upload attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Everything local is already on the remote.
    NothingToUpload,
    /// Upload is blocked; the state field names the reason.
    Blocked(UploadSyncState),
    /// This many commits were shipped.
    Uploaded(usize),
}

/// Upload state machine for one page.
pub struct UploadDriver {
    db: Arc<dyn PageDb>,
    graph: Arc<CommitGraph>,
    objects: Arc<ObjectStore>,
    remote: Arc<dyn RemoteStore>,
    state: Arc<SyncStatePublisher>,
    config: SyncConfig,
}

impl UploadDriver {
    pub fn new(
        db: Arc<dyn PageDb>,
        graph: Arc<CommitGraph>,
        objects: Arc<ObjectStore>,
        remote: Arc<dyn RemoteStore>,
        state: Arc<SyncStatePublisher>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            graph,
            objects,
            remote,
            state,
            config,
        }
    }

    /// Mark a commit as present on the remote. Also used by the download
    /// half for commits that arrived from the remote.
    pub async fn mark_commit_uploaded(&self, id: &CommitId) -> Result<()> {
        self.db.put(&uploaded_commit_key(id), &[]).await
    }

    async fn commit_uploaded(&self, id: &CommitId) -> Result<bool> {
        if *id == self.graph.genesis() {
            // Every device constructs the same genesis; it never needs
            // to travel.
            return Ok(true);
        }
        Ok(self.db.get(&uploaded_commit_key(id)).await?.is_some())
    }

    async fn object_uploaded(&self, digest: &ObjectDigest) -> Result<bool> {
        Ok(self.db.get(&uploaded_object_key(digest)).await?.is_some())
    }

    /// Local commits not yet on the remote, parents before children.
    pub async fn pending_commits(&self) -> Result<Vec<(CommitId, Commit)>> {
        let mut pending: Vec<(CommitId, Commit)> = Vec::new();
        let mut seen: HashSet<CommitId> = HashSet::new();
        let mut queue: Vec<CommitId> = self.graph.heads().await.iter().map(|(id, _)| *id).collect();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) || self.commit_uploaded(&id).await? {
                continue;
            }
            let commit = self.graph.get_commit(&id).await?;
            queue.extend(commit.parents.iter().copied());
            pending.push((id, commit));
        }

        // Topological order: emit commits whose parents are all outside
        // the remaining pending set.
        let mut ordered = Vec::with_capacity(pending.len());
        let mut remaining: HashSet<CommitId> = pending.iter().map(|(id, _)| *id).collect();
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|(id, commit)| {
                if commit.parents.iter().any(|p| remaining.contains(p) && p != id) {
                    true
                } else {
                    remaining.remove(id);
                    ordered.push((*id, commit.clone()));
                    false
                }
            });
            if pending.len() == before {
                return Err(Error::Internal("Commit graph cycle detected".to_string()));
            }
        }
        Ok(ordered)
    }

    /// Eager objects a commit newly references: its root tree object,
    /// plus every eager entry's object graph, skipping anything already
    /// shipped.
    async fn eager_objects_for(
        &self,
        commit: &Commit,
        collected: &mut HashSet<ObjectDigest>,
    ) -> Result<Vec<(ObjectDigest, Bytes)>> {
        let mut out = Vec::new();
        let mut queue = vec![commit.root];
        let tree = PageTree::load(&self.objects, &commit.root).await?;
        for (_, entry) in tree.iter() {
            if entry.priority == ObjectPriority::Eager {
                queue.push(entry.object);
            }
        }
        while let Some(digest) = queue.pop() {
            if !collected.insert(digest) || self.object_uploaded(&digest).await? {
                continue;
            }
            let record = self.objects.read_raw(&digest).await?;
            queue.extend(self.objects.references(&digest).await?);
            out.push((digest, record));
        }
        Ok(out)
    }

    /// Attempt to ship all pending local commits.
    ///
    /// Network failures are retried with exponential backoff up to the
    /// configured limit; while retrying the upload state reads `Error`.
    pub async fn upload_pending(&self) -> Result<UploadOutcome> {
        let pending = self.pending_commits().await?;
        if pending.is_empty() {
            self.state.set_upload(UploadSyncState::Idle);
            return Ok(UploadOutcome::NothingToUpload);
        }
        self.state.set_upload(UploadSyncState::Pending);

        match self.state.get().download {
            DownloadSyncState::CatchUp => {
                self.state.set_upload(UploadSyncState::WaitCatchUp);
                return Ok(UploadOutcome::Blocked(UploadSyncState::WaitCatchUp));
            }
            DownloadSyncState::RemoteCommit => {
                self.state.set_upload(UploadSyncState::WaitRemoteDownload);
                return Ok(UploadOutcome::Blocked(UploadSyncState::WaitRemoteDownload));
            }
            _ => {}
        }
        if self.graph.head_count().await > 1 {
            self.state.set_upload(UploadSyncState::WaitTooManyHeads);
            return Ok(UploadOutcome::Blocked(UploadSyncState::WaitTooManyHeads));
        }

        self.state.set_upload(UploadSyncState::InProgress);

        let mut commits = Vec::with_capacity(pending.len());
        let mut objects = Vec::new();
        let mut collected = HashSet::new();
        for (id, commit) in &pending {
            objects.extend(self.eager_objects_for(commit, &mut collected).await?);
            commits.push(RemoteCommitRecord {
                id: *id,
                payload: Bytes::from(commit.to_bytes()?),
            });
        }
        let batch = UploadBatch::new(commits, objects.clone());

        let mut backoff = Backoff::new(self.config.backoff);
        loop {
            match self.remote.upload_batch(batch.clone()).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && backoff.attempts() < self.config.max_retries => {
                    warn!(error = %e, attempt = backoff.attempts(), "upload failed, backing off");
                    self.state.set_upload(UploadSyncState::Error);
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => {
                    self.state.set_upload(UploadSyncState::Error);
                    return Err(e);
                }
            }
        }

        let mut markers = WriteBatch::new();
        for (id, _) in &pending {
            markers.put(uploaded_commit_key(id), Vec::new());
        }
        for (digest, _) in &objects {
            markers.put(uploaded_object_key(digest), Vec::new());
        }
        self.db.apply_batch(markers).await?;

        self.state.set_upload(UploadSyncState::Idle);
        debug!(commits = pending.len(), objects = objects.len(), "uploaded batch");
        Ok(UploadOutcome::Uploaded(pending.len()))
    }

    /// Mark an object as present on the remote.
    pub async fn mark_object_uploaded(&self, digest: &ObjectDigest) -> Result<()> {
        self.db.put(&uploaded_object_key(digest), &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FakeRemote;
    use folio_core::{Journal, MemoryDb};

    struct Fixture {
        db: Arc<dyn PageDb>,
        graph: Arc<CommitGraph>,
        objects: Arc<ObjectStore>,
        remote: Arc<FakeRemote>,
        state: Arc<SyncStatePublisher>,
        driver: UploadDriver,
    }

    async fn fixture_with(config: SyncConfig) -> Fixture {
        let db: Arc<dyn PageDb> = Arc::new(MemoryDb::new());
        let objects = Arc::new(ObjectStore::new(db.clone()));
        let graph = Arc::new(CommitGraph::open(db.clone(), &objects).await.unwrap());
        let remote = Arc::new(FakeRemote::new());
        let state = Arc::new(SyncStatePublisher::new());
        let driver = UploadDriver::new(
            db.clone(),
            graph.clone(),
            objects.clone(),
            remote.clone(),
            state.clone(),
            config,
        );
        Fixture {
            db,
            graph,
            objects,
            remote,
            state,
            driver,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(SyncConfig {
            max_retries: 3,
            backoff: crate::backoff::BackoffPolicy {
                initial: std::time::Duration::from_millis(1),
                factor: 2,
                max: std::time::Duration::from_millis(10),
            },
        })
        .await
    }

    async fn commit_value(fx: &Fixture, base: CommitId, key: &[u8], value: &[u8]) -> CommitId {
        let mut journal = Journal::new_simple(fx.graph.clone(), fx.objects.clone(), base);
        journal
            .put_bytes(key.to_vec(), value, ObjectPriority::Eager)
            .await
            .unwrap();
        journal.commit().await.unwrap()
    }

    #[tokio::test]
    async fn test_nothing_to_upload_on_fresh_page() {
        let fx = fixture().await;
        assert_eq!(
            fx.driver.upload_pending().await.unwrap(),
            UploadOutcome::NothingToUpload
        );
        assert_eq!(fx.remote.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_uploads_commit_with_eager_objects() {
        let fx = fixture().await;
        let id = commit_value(&fx, fx.graph.genesis(), b"k", b"v").await;

        assert_eq!(
            fx.driver.upload_pending().await.unwrap(),
            UploadOutcome::Uploaded(1)
        );
        assert_eq!(fx.remote.commit_count(), 1);
        assert_eq!(fx.state.get().upload, UploadSyncState::Idle);

        // The commit's root tree and the value object are on the remote.
        let commit = fx.graph.get_commit(&id).await.unwrap();
        assert!(fx.remote.has_object(&commit.root).await.unwrap());
        let tree = PageTree::load(&fx.objects, &commit.root).await.unwrap();
        let entry = tree.get(b"k").unwrap();
        assert!(fx.remote.has_object(&entry.object).await.unwrap());
    }

    #[tokio::test]
    async fn test_lazy_objects_are_not_uploaded() {
        let fx = fixture().await;
        let mut journal =
            Journal::new_simple(fx.graph.clone(), fx.objects.clone(), fx.graph.genesis());
        journal
            .put_bytes(b"big".to_vec(), b"lazy payload", ObjectPriority::Lazy)
            .await
            .unwrap();
        let id = journal.commit().await.unwrap();

        fx.driver.upload_pending().await.unwrap();
        let commit = fx.graph.get_commit(&id).await.unwrap();
        let tree = PageTree::load(&fx.objects, &commit.root).await.unwrap();
        let entry = tree.get(b"big").unwrap();
        assert!(!fx.remote.has_object(&entry.object).await.unwrap());
        // The tree itself still travels.
        assert!(fx.remote.has_object(&commit.root).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_upload_ships_nothing_new() {
        let fx = fixture().await;
        commit_value(&fx, fx.graph.genesis(), b"k", b"v").await;
        fx.driver.upload_pending().await.unwrap();
        assert_eq!(
            fx.driver.upload_pending().await.unwrap(),
            UploadOutcome::NothingToUpload
        );
        assert_eq!(fx.remote.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_blocked_on_multiple_heads() {
        let fx = fixture().await;
        commit_value(&fx, fx.graph.genesis(), b"k", b"v1").await;
        commit_value(&fx, fx.graph.genesis(), b"k", b"v2").await;

        assert_eq!(
            fx.driver.upload_pending().await.unwrap(),
            UploadOutcome::Blocked(UploadSyncState::WaitTooManyHeads)
        );
        assert_eq!(fx.state.get().upload, UploadSyncState::WaitTooManyHeads);
        assert_eq!(fx.remote.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_blocked_during_catch_up_download() {
        let fx = fixture().await;
        commit_value(&fx, fx.graph.genesis(), b"k", b"v").await;
        fx.state.set_download(DownloadSyncState::CatchUp);

        assert_eq!(
            fx.driver.upload_pending().await.unwrap(),
            UploadOutcome::Blocked(UploadSyncState::WaitCatchUp)
        );
    }

    #[tokio::test]
    async fn test_retries_network_errors_with_backoff() {
        let fx = fixture().await;
        commit_value(&fx, fx.graph.genesis(), b"k", b"v").await;
        fx.remote.fail_next(2);

        assert_eq!(
            fx.driver.upload_pending().await.unwrap(),
            UploadOutcome::Uploaded(1)
        );
        assert_eq!(fx.remote.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let fx = fixture().await;
        commit_value(&fx, fx.graph.genesis(), b"k", b"v").await;
        fx.remote.fail_next(10);

        assert!(matches!(
            fx.driver.upload_pending().await,
            Err(Error::Network(_))
        ));
        assert_eq!(fx.state.get().upload, UploadSyncState::Error);
        // Local state is untouched; the commit is still pending.
        assert_eq!(fx.driver.pending_commits().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_commits_ordered_parents_first() {
        let fx = fixture().await;
        let a = commit_value(&fx, fx.graph.genesis(), b"k", b"1").await;
        let b = commit_value(&fx, a, b"k", b"2").await;
        let c = commit_value(&fx, b, b"k", b"3").await;

        let pending = fx.driver.pending_commits().await.unwrap();
        let ids: Vec<CommitId> = pending.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, b, c]);
        let _ = &fx.db;
    }
}
