//! Sync state tracking and watcher notification.
//!
//! Each page carries a download state and an upload state. Multiple
//! reporters may feed the same container; reports merge monotonically by
//! a fixed precedence so a watcher never sees an error report swallowed
//! by a later idle report from another source. Watchers observe state
//! changes in the order they occur locally.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Download phase of a page's synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadSyncState {
    Idle,
    /// Initial/backlog fetch of remote commits.
    CatchUp,
    /// Steady-state watch: applying a freshly pushed remote commit.
    RemoteCommit,
    Error,
}

impl DownloadSyncState {
    fn rank(self) -> u8 {
        match self {
            DownloadSyncState::Idle => 0,
            DownloadSyncState::CatchUp => 1,
            DownloadSyncState::RemoteCommit => 2,
            DownloadSyncState::Error => 3,
        }
    }
}

/// Upload phase of a page's synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadSyncState {
    Idle,
    /// A local commit was detected and is waiting to be shipped.
    Pending,
    /// Upload blocked until the catch-up download finishes.
    WaitCatchUp,
    /// Upload blocked until the merge resolver collapses the heads.
    WaitTooManyHeads,
    /// Upload blocked while a remote commit download is in flight.
    WaitRemoteDownload,
    InProgress,
    Error,
}

impl UploadSyncState {
    fn rank(self) -> u8 {
        match self {
            UploadSyncState::Idle => 0,
            UploadSyncState::Pending => 1,
            UploadSyncState::WaitCatchUp => 2,
            UploadSyncState::WaitTooManyHeads => 3,
            UploadSyncState::WaitRemoteDownload => 4,
            UploadSyncState::InProgress => 5,
            UploadSyncState::Error => 6,
        }
    }
}

/// The (download, upload) pair watchers receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateContainer {
    pub download: DownloadSyncState,
    pub upload: UploadSyncState,
}

impl Default for SyncStateContainer {
    fn default() -> Self {
        Self {
            download: DownloadSyncState::Idle,
            upload: UploadSyncState::Idle,
        }
    }
}

impl SyncStateContainer {
    /// Merge another report into this one, keeping the higher-precedence
    /// state per field.
    pub fn merge(&mut self, other: SyncStateContainer) {
        if other.download.rank() > self.download.rank() {
            self.download = other.download;
        }
        if other.upload.rank() > self.upload.rank() {
            self.upload = other.upload;
        }
    }
}

/// Capacity of the watcher channel; a watcher that lags this far behind
/// misses intermediate states but still converges on the latest.
const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Publishes sync-state changes to any number of watchers.
///
/// All mutation goes through the internal lock, so every watcher
/// receives the same sequence of containers in the same order.
pub struct SyncStatePublisher {
    current: Mutex<SyncStateContainer>,
    tx: broadcast::Sender<SyncStateContainer>,
}

impl Default for SyncStatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatePublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(SyncStateContainer::default()),
            tx,
        }
    }

    /// Current state snapshot.
    pub fn get(&self) -> SyncStateContainer {
        *self.current.lock().expect("sync state lock poisoned")
    }

    /// Subscribe to state changes. The subscriber should read the
    /// current state with [`get`](Self::get) first.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStateContainer> {
        self.tx.subscribe()
    }

    fn publish_locked(&self, updated: SyncStateContainer) {
        // A send error only means no watcher is subscribed.
        let _ = self.tx.send(updated);
        debug!(download = ?updated.download, upload = ?updated.upload, "sync state changed");
    }

    /// Replace the download state. The owning state machine moves states
    /// in both directions, so this is a direct set.
    pub fn set_download(&self, state: DownloadSyncState) {
        let mut current = self.current.lock().expect("sync state lock poisoned");
        if current.download == state {
            return;
        }
        current.download = state;
        self.publish_locked(*current);
    }

    /// Replace the upload state.
    pub fn set_upload(&self, state: UploadSyncState) {
        let mut current = self.current.lock().expect("sync state lock poisoned");
        if current.upload == state {
            return;
        }
        current.upload = state;
        self.publish_locked(*current);
    }

    /// Merge a report from a secondary watcher source by precedence.
    pub fn merge_report(&self, report: SyncStateContainer) {
        let mut current = self.current.lock().expect("sync state lock poisoned");
        let before = *current;
        current.merge(report);
        if *current != before {
            self.publish_locked(*current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_monotone() {
        let mut state = SyncStateContainer::default();
        state.merge(SyncStateContainer {
            download: DownloadSyncState::CatchUp,
            upload: UploadSyncState::Error,
        });
        assert_eq!(state.download, DownloadSyncState::CatchUp);
        assert_eq!(state.upload, UploadSyncState::Error);

        // A lower-precedence report does not regress the container.
        state.merge(SyncStateContainer::default());
        assert_eq!(state.download, DownloadSyncState::CatchUp);
        assert_eq!(state.upload, UploadSyncState::Error);
    }

    #[tokio::test]
    async fn test_watchers_observe_changes_in_order() {
        let publisher = SyncStatePublisher::new();
        let mut w1 = publisher.subscribe();
        let mut w2 = publisher.subscribe();

        publisher.set_download(DownloadSyncState::CatchUp);
        publisher.set_upload(UploadSyncState::Pending);
        publisher.set_download(DownloadSyncState::Idle);

        for watcher in [&mut w1, &mut w2] {
            let first = watcher.recv().await.unwrap();
            assert_eq!(first.download, DownloadSyncState::CatchUp);
            let second = watcher.recv().await.unwrap();
            assert_eq!(second.upload, UploadSyncState::Pending);
            let third = watcher.recv().await.unwrap();
            assert_eq!(third.download, DownloadSyncState::Idle);
        }
    }

    #[tokio::test]
    async fn test_no_notification_without_change() {
        let publisher = SyncStatePublisher::new();
        let mut watcher = publisher.subscribe();
        publisher.set_download(DownloadSyncState::Idle);
        publisher.merge_report(SyncStateContainer::default());
        assert!(matches!(
            watcher.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
