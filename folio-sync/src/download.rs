//! Download half of the sync engine.
//!
//! Pulls remote commits into the local graph, in two modes: a catch-up
//! scan of everything past the persisted cursor, and single-commit
//! application driven by the remote watch stream. Commits that arrive
//! before their parents are buffered and replayed once the parents land.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use folio_core::{
    Commit, CommitGraph, Error, ObjectDigest, ObjectPriority, ObjectStore, PageDb, PageTree,
    Result,
};

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::remote::{RemoteCommitRecord, RemoteCursor, RemoteStore};
use crate::state::{DownloadSyncState, SyncStatePublisher};
use crate::upload::{uploaded_commit_key, uploaded_object_key};

const CURSOR_KEY: &[u8] = b"sync/cursor";

/// Download state machine for one page.
pub struct DownloadDriver {
    db: Arc<dyn PageDb>,
    graph: Arc<CommitGraph>,
    objects: Arc<ObjectStore>,
    remote: Arc<dyn RemoteStore>,
    state: Arc<SyncStatePublisher>,
    config: SyncConfig,
}

impl DownloadDriver {
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

    /// Position in the remote log this device has consumed up to.
    pub async fn cursor(&self) -> Result<RemoteCursor> {
        match self.db.get(CURSOR_KEY).await? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes[..]
                    .try_into()
                    .map_err(|_| Error::Storage("Bad sync cursor".to_string()))?;
                Ok(RemoteCursor::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }

    async fn set_cursor(&self, cursor: RemoteCursor) -> Result<()> {
        self.db.put(CURSOR_KEY, &cursor.to_le_bytes()).await
    }

    /// Fetch an object record from the remote if it is not already
    /// present locally, along with everything it references.
    pub async fn ensure_object(&self, digest: &ObjectDigest) -> Result<()> {
        let mut queue = vec![*digest];
        while let Some(current) = queue.pop() {
            if self.objects.exists(&current).await? {
                continue;
            }
            let record = self.fetch_object(&current).await?;
            self.objects.put_raw(&current, &record).await?;
            queue.extend(self.objects.references(&current).await?);
        }
        Ok(())
    }

    async fn fetch_object(&self, digest: &ObjectDigest) -> Result<Bytes> {
        let mut backoff = Backoff::new(self.config.backoff);
        loop {
            match self.remote.download_object(digest).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() && backoff.attempts() < self.config.max_retries => {
                    warn!(object = %digest, error = %e, "object download failed, backing off");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply one remote commit record: verify its id, fetch the eager
    /// objects it references, and insert it into the graph. Returns
    /// `false` without applying when a parent is not yet known locally.
    async fn try_apply(&self, record: &RemoteCommitRecord) -> Result<bool> {
        let commit = Commit::from_bytes(&record.payload)?;
        if commit.id() != record.id {
            return Err(Error::InvalidArgument(format!(
                "Remote commit id {} does not match its payload",
                record.id
            )));
        }
        if self.graph.contains(&record.id).await? {
            return Ok(true);
        }
        for parent in &commit.parents {
            if !self.graph.contains(parent).await? {
                return Ok(false);
            }
        }

        self.ensure_object(&commit.root).await?;
        let tree = PageTree::load(&self.objects, &commit.root).await?;
        for (_, entry) in tree.iter() {
            if entry.priority == ObjectPriority::Eager {
                self.ensure_object(&entry.object).await?;
            }
        }

        self.graph.insert_commit(&commit).await?;
        // Remote-originated commits must never be shipped back.
        self.db.put(&uploaded_commit_key(&record.id), &[]).await?;
        self.db.put(&uploaded_object_key(&commit.root), &[]).await?;
        debug!(commit = %record.id, "applied remote commit");
        Ok(true)
    }

    /// Apply what the buffer allows, replaying it after each success so
    /// children unblocked by a newly applied parent land in the same
    /// pass. Records whose parents are still absent stay buffered.
    async fn apply_pending(&self, pending: &mut VecDeque<RemoteCommitRecord>) -> Result<usize> {
        let mut applied = 0;
        loop {
            let mut progressed = false;
            for _ in 0..pending.len() {
                let record = match pending.pop_front() {
                    Some(r) => r,
                    None => break,
                };
                if self.try_apply(&record).await? {
                    applied += 1;
                    progressed = true;
                } else {
                    pending.push_back(record);
                }
            }
            if pending.is_empty() || !progressed {
                return Ok(applied);
            }
        }
    }

    /// Scan the remote log from the persisted cursor until caught up.
    ///
    /// The cursor is only persisted past records that were applied;
    /// records still waiting on absent ancestors are refetched by the
    /// next catch-up rather than skipped.
    pub async fn catch_up(&self) -> Result<usize> {
        self.state.set_download(DownloadSyncState::CatchUp);
        let mut total = 0;
        let mut backoff = Backoff::new(self.config.backoff);
        let mut cursor = self.cursor().await?;
        let mut pending: VecDeque<RemoteCommitRecord> = VecDeque::new();
        loop {
            let (records, next_cursor) = match self.remote.commits_since(cursor).await {
                Ok(batch) => batch,
                Err(e) if e.is_retryable() && backoff.attempts() < self.config.max_retries => {
                    warn!(error = %e, attempt = backoff.attempts(), "catch-up failed, backing off");
                    self.state.set_download(DownloadSyncState::Error);
                    tokio::time::sleep(backoff.next_delay()).await;
                    self.state.set_download(DownloadSyncState::CatchUp);
                    continue;
                }
                Err(e) => {
                    self.state.set_download(DownloadSyncState::Error);
                    return Err(e);
                }
            };
            backoff.reset();
            if records.is_empty() {
                break;
            }
            pending.extend(records);
            total += self.apply_pending(&mut pending).await?;
            cursor = next_cursor;
            if pending.is_empty() {
                self.set_cursor(cursor).await?;
            }
        }
        if !pending.is_empty() {
            warn!(
                dangling = pending.len(),
                "remote log has commits with absent ancestors"
            );
        }
        self.state.set_download(DownloadSyncState::Idle);
        debug!(commits = total, "catch-up complete");
        Ok(total)
    }

    /// Apply a single commit pushed by the remote watch stream.
    pub async fn on_remote_commit(&self, record: RemoteCommitRecord) -> Result<bool> {
        self.state.set_download(DownloadSyncState::RemoteCommit);
        let result = self.try_apply(&record).await;
        match &result {
            Ok(_) => self.state.set_download(DownloadSyncState::Idle),
            Err(_) => self.state.set_download(DownloadSyncState::Error),
        }
        result
    }

    /// Consume the watch stream until it closes, applying each pushed
    /// commit. Lagged gaps fall back to a catch-up scan.
    pub async fn run_watch(&self, mut rx: broadcast::Receiver<RemoteCommitRecord>) -> Result<()> {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    if !self.on_remote_commit(record).await? {
                        // Parent missing; the log has it.
                        self.catch_up().await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch stream lagged, re-scanning remote log");
                    self.catch_up().await?;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}
