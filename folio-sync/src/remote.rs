//! Remote store interface.
//!
//! The wire format and client library of the real remote are out of
//! scope; sync is written against these traits. Implementations that
//! store entries under string keys should run them through
//! [`folio_core::encode_key`] so user keys cannot collide with the
//! remote's reserved names. `FakeRemote` is an in-memory implementation
//! used in tests, with failure injection for exercising the retry path.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

use folio_core::{CommitId, Error, ObjectDigest, Result};

/// Position in the remote's append-only commit log.
pub type RemoteCursor = u64;

/// A commit as shipped over the wire: its id plus the serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommitRecord {
    pub id: CommitId,
    pub payload: Bytes,
}

/// One upload unit: new commits plus the objects they newly reference,
/// protected by a content hash the receiver verifies.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub commits: Vec<RemoteCommitRecord>,
    pub objects: Vec<(ObjectDigest, Bytes)>,
    pub content_hash: ObjectDigest,
}

impl UploadBatch {
    pub fn new(commits: Vec<RemoteCommitRecord>, objects: Vec<(ObjectDigest, Bytes)>) -> Self {
        let content_hash = Self::compute_content_hash(&commits, &objects);
        Self {
            commits,
            objects,
            content_hash,
        }
    }

    /// Hash over all commit and object payloads in batch order.
    pub fn compute_content_hash(
        commits: &[RemoteCommitRecord],
        objects: &[(ObjectDigest, Bytes)],
    ) -> ObjectDigest {
        let mut hasher = Sha256::new();
        for commit in commits {
            hasher.update(commit.id.as_bytes());
            hasher.update((commit.payload.len() as u64).to_le_bytes());
            hasher.update(&commit.payload);
        }
        for (digest, data) in objects {
            hasher.update(digest.as_bytes());
            hasher.update((data.len() as u64).to_le_bytes());
            hasher.update(data);
        }
        ObjectDigest::new(hasher.finalize().into())
    }

    pub fn verify_content_hash(&self) -> bool {
        Self::compute_content_hash(&self.commits, &self.objects) == self.content_hash
    }
}

/// Append-only remote commit/object store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload a batch of commits and objects.
    async fn upload_batch(&self, batch: UploadBatch) -> Result<()>;

    /// Commits appended after `cursor`, with the new cursor. An empty
    /// result means the local view is caught up.
    async fn commits_since(&self, cursor: RemoteCursor)
        -> Result<(Vec<RemoteCommitRecord>, RemoteCursor)>;

    /// Subscribe to commits pushed by other devices.
    fn watch_commits(&self) -> broadcast::Receiver<RemoteCommitRecord>;

    /// Download a raw object record by digest.
    async fn download_object(&self, digest: &ObjectDigest) -> Result<Bytes>;

    /// Whether the remote already holds an object.
    async fn has_object(&self, digest: &ObjectDigest) -> Result<bool>;
}

/// Outcome of a fingerprint check against the remote's device set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintCheck {
    /// The fingerprint is registered in the device set.
    Match,
    /// The remote knows this device under a different fingerprint.
    Mismatch,
    /// The fingerprint is not in the device set. Whether that means a
    /// fresh device or a reset remote is decided client-side from the
    /// device's own registration record.
    NotSet,
}

/// Remote-side device set: every syncing device registers its
/// fingerprint here. A fingerprint vanishing from the set means the
/// remote was reset or recreated.
#[async_trait]
pub trait RemoteFingerprint: Send + Sync {
    async fn check_fingerprint(&self, fingerprint: &[u8]) -> Result<FingerprintCheck>;
    /// Add a fingerprint to the device set.
    async fn set_fingerprint(&self, fingerprint: &[u8]) -> Result<()>;
    /// Notified when the device set changes.
    fn watch_fingerprint(&self) -> broadcast::Receiver<Bytes>;
}

const WATCH_CAPACITY: usize = 64;

/// In-memory remote for tests.
pub struct FakeRemote {
    log: Mutex<Vec<RemoteCommitRecord>>,
    objects: Mutex<HashMap<ObjectDigest, Bytes>>,
    fingerprints: Mutex<HashSet<Bytes>>,
    commit_tx: broadcast::Sender<RemoteCommitRecord>,
    fingerprint_tx: broadcast::Sender<Bytes>,
    /// Number of upcoming calls that fail with a network error.
    fail_next: AtomicUsize,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        let (commit_tx, _) = broadcast::channel(WATCH_CAPACITY);
        let (fingerprint_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            log: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
            fingerprints: Mutex::new(HashSet::new()),
            commit_tx,
            fingerprint_tx,
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` remote calls fail with a network error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Network("injected failure".to_string()));
        }
        Ok(())
    }

    /// Number of commits in the remote log.
    pub fn commit_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Append a commit as if another device had uploaded it, notifying
    /// watchers.
    pub fn push_commit(&self, record: RemoteCommitRecord) {
        self.log.lock().unwrap().push(record.clone());
        let _ = self.commit_tx.send(record);
    }

    /// Store an object as if another device had uploaded it.
    pub fn push_object(&self, digest: ObjectDigest, data: Bytes) {
        self.objects.lock().unwrap().insert(digest, data);
    }

    /// Erase the device set, simulating a remote reset or recreation.
    pub fn clear_fingerprints(&self) {
        self.fingerprints.lock().unwrap().clear();
        let _ = self.fingerprint_tx.send(Bytes::new());
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn upload_batch(&self, batch: UploadBatch) -> Result<()> {
        self.maybe_fail()?;
        if !batch.verify_content_hash() {
            return Err(Error::InvalidArgument(
                "Upload batch content hash mismatch".to_string(),
            ));
        }
        {
            let mut objects = self.objects.lock().unwrap();
            for (digest, data) in &batch.objects {
                objects.insert(*digest, data.clone());
            }
        }
        let mut log = self.log.lock().unwrap();
        for commit in batch.commits {
            if log.iter().any(|c| c.id == commit.id) {
                continue;
            }
            log.push(commit.clone());
            let _ = self.commit_tx.send(commit);
        }
        Ok(())
    }

    async fn commits_since(
        &self,
        cursor: RemoteCursor,
    ) -> Result<(Vec<RemoteCommitRecord>, RemoteCursor)> {
        self.maybe_fail()?;
        let log = self.log.lock().unwrap();
        let start = cursor as usize;
        if start >= log.len() {
            return Ok((Vec::new(), cursor));
        }
        Ok((log[start..].to_vec(), log.len() as RemoteCursor))
    }

    fn watch_commits(&self) -> broadcast::Receiver<RemoteCommitRecord> {
        self.commit_tx.subscribe()
    }

    async fn download_object(&self, digest: &ObjectDigest) -> Result<Bytes> {
        self.maybe_fail()?;
        self.objects
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Remote object {}", digest)))
    }

    async fn has_object(&self, digest: &ObjectDigest) -> Result<bool> {
        self.maybe_fail()?;
        Ok(self.objects.lock().unwrap().contains_key(digest))
    }
}

#[async_trait]
impl RemoteFingerprint for FakeRemote {
    async fn check_fingerprint(&self, fingerprint: &[u8]) -> Result<FingerprintCheck> {
        self.maybe_fail()?;
        if self.fingerprints.lock().unwrap().contains(fingerprint) {
            Ok(FingerprintCheck::Match)
        } else {
            Ok(FingerprintCheck::NotSet)
        }
    }

    async fn set_fingerprint(&self, fingerprint: &[u8]) -> Result<()> {
        self.maybe_fail()?;
        let bytes = Bytes::copy_from_slice(fingerprint);
        self.fingerprints.lock().unwrap().insert(bytes.clone());
        let _ = self.fingerprint_tx.send(bytes);
        Ok(())
    }

    fn watch_fingerprint(&self) -> broadcast::Receiver<Bytes> {
        self.fingerprint_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(byte: u8) -> RemoteCommitRecord {
        RemoteCommitRecord {
            id: CommitId::new([byte; 32]),
            payload: Bytes::from(vec![byte; 4]),
        }
    }

    #[tokio::test]
    async fn test_upload_and_fetch_commits() {
        let remote = FakeRemote::new();
        let batch = UploadBatch::new(vec![record(1), record(2)], Vec::new());
        remote.upload_batch(batch).await.unwrap();

        let (commits, cursor) = remote.commits_since(0).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(cursor, 2);

        let (commits, cursor) = remote.commits_since(cursor).await.unwrap();
        assert!(commits.is_empty());
        assert_eq!(cursor, 2);
    }

    #[tokio::test]
    async fn test_upload_rejects_tampered_batch() {
        let remote = FakeRemote::new();
        let mut batch = UploadBatch::new(vec![record(1)], Vec::new());
        batch.commits[0].payload = Bytes::from_static(b"tampered");
        assert!(matches!(
            remote.upload_batch(batch).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_commits_not_reappended() {
        let remote = FakeRemote::new();
        remote
            .upload_batch(UploadBatch::new(vec![record(1)], Vec::new()))
            .await
            .unwrap();
        remote
            .upload_batch(UploadBatch::new(vec![record(1)], Vec::new()))
            .await
            .unwrap();
        assert_eq!(remote.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = FakeRemote::new();
        remote.fail_next(2);
        assert!(remote.commits_since(0).await.is_err());
        assert!(remote.commits_since(0).await.is_err());
        assert!(remote.commits_since(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_receives_pushed_commits() {
        let remote = FakeRemote::new();
        let mut rx = remote.watch_commits();
        remote.push_commit(record(9));
        let received = rx.recv().await.unwrap();
        assert_eq!(received, record(9));
    }

    #[tokio::test]
    async fn test_device_set_holds_many_fingerprints() {
        let remote = FakeRemote::new();
        assert_eq!(
            remote.check_fingerprint(b"device-a").await.unwrap(),
            FingerprintCheck::NotSet
        );
        remote.set_fingerprint(b"device-a").await.unwrap();
        remote.set_fingerprint(b"device-b").await.unwrap();
        assert_eq!(
            remote.check_fingerprint(b"device-a").await.unwrap(),
            FingerprintCheck::Match
        );
        assert_eq!(
            remote.check_fingerprint(b"device-b").await.unwrap(),
            FingerprintCheck::Match
        );

        remote.clear_fingerprints();
        assert_eq!(
            remote.check_fingerprint(b"device-a").await.unwrap(),
            FingerprintCheck::NotSet
        );
    }
}
