//! One page's sync session.
//!
//! Owns the upload and download drivers plus the page's merge resolver
//! and sequences them: fingerprint gate, catch-up, merge convergence,
//! upload. The session also answers the synced-state query the eviction
//! manager asks before discarding a page's local storage.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use folio_core::{CommitGraph, ObjectStore, PageDb, PageId, PageMergeResolver, Result};

use crate::config::SyncConfig;
use crate::download::DownloadDriver;
use crate::fingerprint::{self, DeviceFingerprint};
use crate::remote::{RemoteFingerprint, RemoteStore};
use crate::state::{SyncStateContainer, SyncStatePublisher};
use crate::upload::{UploadDriver, UploadOutcome};

/// Coordinates sync for a single page against one remote.
pub struct SyncSession {
    page: PageId,
    db: Arc<dyn PageDb>,
    graph: Arc<CommitGraph>,
    resolver: Arc<PageMergeResolver>,
    state: Arc<SyncStatePublisher>,
    upload: UploadDriver,
    download: DownloadDriver,
}

impl SyncSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        page: PageId,
        db: Arc<dyn PageDb>,
        graph: Arc<CommitGraph>,
        objects: Arc<ObjectStore>,
        remote: Arc<dyn RemoteStore>,
        resolver: Arc<PageMergeResolver>,
        config: SyncConfig,
    ) -> Self {
        let state = Arc::new(SyncStatePublisher::new());
        let upload = UploadDriver::new(
            db.clone(),
            graph.clone(),
            objects.clone(),
            remote.clone(),
            state.clone(),
            config.clone(),
        );
        let download = DownloadDriver::new(
            db.clone(),
            graph.clone(),
            objects,
            remote,
            state.clone(),
            config,
        );
        Self {
            page,
            db,
            graph,
            resolver,
            state,
            upload,
            download,
        }
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    /// Current sync state snapshot.
    pub fn state(&self) -> SyncStateContainer {
        self.state.get()
    }

    /// Subscribe to sync state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStateContainer> {
        self.state.subscribe()
    }

    pub fn download(&self) -> &DownloadDriver {
        &self.download
    }

    pub fn upload(&self) -> &UploadDriver {
        &self.upload
    }

    /// Run one full sync round: verify the remote identity, catch up on
    /// remote commits, converge divergent heads, then ship local commits.
    ///
    /// Uploading can surface new divergence (a remote commit applied
    /// between merge and upload), so a head-blocked upload loops back
    /// through the resolver until it goes through.
    pub async fn sync_once(&self, remote_fp: &dyn RemoteFingerprint) -> Result<DeviceFingerprint> {
        let fp = fingerprint::check_or_set(&self.db, remote_fp).await?;
        self.download.catch_up().await?;

        loop {
            let merges = self.resolver.resolve_until_converged().await?;
            if merges > 0 {
                debug!(page = %self.page, merges, "converged heads before upload");
            }
            match self.upload.upload_pending().await? {
                UploadOutcome::Blocked(_) if self.graph.head_count().await > 1 => continue,
                outcome => {
                    info!(page = %self.page, ?outcome, "sync round complete");
                    return Ok(fp);
                }
            }
        }
    }

    /// Whether every local commit of this page has reached the remote.
    /// Used by the eviction manager as the safety gate for discarding
    /// local storage.
    pub async fn page_is_synced(&self) -> Result<bool> {
        Ok(self.upload.pending_commits().await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FakeRemote;
    use folio_core::{
        Error, Journal, LastOneWinsStrategy, MemoryDb, ObjectPriority, PageTree,
    };

    struct Device {
        graph: Arc<CommitGraph>,
        objects: Arc<ObjectStore>,
        session: SyncSession,
    }

    fn config() -> SyncConfig {
        SyncConfig {
            max_retries: 3,
            backoff: crate::backoff::BackoffPolicy {
                initial: std::time::Duration::from_millis(1),
                factor: 2,
                max: std::time::Duration::from_millis(10),
            },
        }
    }

    async fn device(remote: Arc<FakeRemote>) -> Device {
        let db: Arc<dyn PageDb> = Arc::new(MemoryDb::new());
        let objects = Arc::new(ObjectStore::new(db.clone()));
        let graph = Arc::new(CommitGraph::open(db.clone(), &objects).await.unwrap());
        let page = PageId::new([1; 16]);
        let resolver = Arc::new(PageMergeResolver::new(
            page,
            graph.clone(),
            objects.clone(),
            Arc::new(LastOneWinsStrategy),
        ));
        let session = SyncSession::new(
            page,
            db,
            graph.clone(),
            objects.clone(),
            remote,
            resolver,
            config(),
        );
        Device {
            graph,
            objects,
            session,
        }
    }

    async fn commit_value(device: &Device, key: &[u8], value: &[u8]) {
        let base = device.graph.heads().await[0].0;
        let mut journal = Journal::new_simple(device.graph.clone(), device.objects.clone(), base);
        journal
            .put_bytes(key.to_vec(), value, ObjectPriority::Eager)
            .await
            .unwrap();
        journal.commit().await.unwrap();
    }

    async fn head_value(device: &Device, key: &[u8]) -> Vec<u8> {
        let head = device.graph.heads().await[0].0;
        let commit = device.graph.get_commit(&head).await.unwrap();
        let tree = PageTree::load(&device.objects, &commit.root).await.unwrap();
        let entry = tree.get(key).unwrap();
        device.objects.read(&entry.object).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_two_devices_converge_through_remote() {
        let remote = Arc::new(FakeRemote::new());
        let a = device(remote.clone()).await;
        let b = device(remote.clone()).await;

        // Both devices edit offline, diverging from the shared genesis.
        commit_value(&a, b"title", b"draft A").await;
        commit_value(&b, b"title", b"draft B").await;

        a.session.sync_once(remote.as_ref()).await.unwrap();
        b.session.sync_once(remote.as_ref()).await.unwrap();
        a.session.sync_once(remote.as_ref()).await.unwrap();

        assert_eq!(a.graph.head_count().await, 1);
        assert_eq!(b.graph.head_count().await, 1);
        assert_eq!(
            a.graph.heads().await[0].0,
            b.graph.heads().await[0].0
        );
        assert_eq!(
            head_value(&a, b"title").await,
            head_value(&b, b"title").await
        );
    }

    #[tokio::test]
    async fn test_sync_blocked_by_fingerprint_mismatch() {
        let remote = Arc::new(FakeRemote::new());
        let a = device(remote.clone()).await;

        a.session.sync_once(remote.as_ref()).await.unwrap();
        // Remote recreated; this device's registration is gone.
        remote.clear_fingerprints();

        commit_value(&a, b"k", b"v").await;
        assert!(matches!(
            a.session.sync_once(remote.as_ref()).await,
            Err(Error::FingerprintMismatch)
        ));
        // Nothing was shipped after the gate failed.
        assert!(!a.session.page_is_synced().await.unwrap());
    }

    #[tokio::test]
    async fn test_page_is_synced_tracks_pending_commits() {
        let remote = Arc::new(FakeRemote::new());
        let a = device(remote.clone()).await;

        assert!(a.session.page_is_synced().await.unwrap());
        commit_value(&a, b"k", b"v").await;
        assert!(!a.session.page_is_synced().await.unwrap());

        a.session.sync_once(remote.as_ref()).await.unwrap();
        assert!(a.session.page_is_synced().await.unwrap());
    }

    #[tokio::test]
    async fn test_merge_before_upload_ships_single_head() {
        let remote = Arc::new(FakeRemote::new());
        let a = device(remote.clone()).await;
        let b = device(remote.clone()).await;

        commit_value(&a, b"k", b"theirs").await;
        a.session.sync_once(remote.as_ref()).await.unwrap();

        commit_value(&b, b"k", b"ours").await;
        // B's round downloads A's commit, merges, and uploads the merge.
        b.session.sync_once(remote.as_ref()).await.unwrap();
        assert_eq!(b.graph.head_count().await, 1);
        assert!(b.session.page_is_synced().await.unwrap());

        a.session.sync_once(remote.as_ref()).await.unwrap();
        assert_eq!(a.graph.heads().await[0].0, b.graph.heads().await[0].0);
    }
}
