//! Folio Sync Library
//!
//! Cloud synchronization for the offline-first page store:
//! - Upload and download state machines with watcher notification
//! - Remote store and fingerprint interfaces (with a test fake)
//! - Device fingerprint gate against remote resets
//! - Exponential backoff for network retries
//! - Per-page sync sessions sequencing download, merge, and upload

pub mod backoff;
pub mod config;
pub mod download;
pub mod fingerprint;
pub mod remote;
pub mod session;
pub mod state;
pub mod upload;

pub use backoff::{Backoff, BackoffPolicy};
pub use config::SyncConfig;
pub use download::DownloadDriver;
pub use fingerprint::DeviceFingerprint;
pub use remote::{
    FakeRemote, FingerprintCheck, RemoteCommitRecord, RemoteCursor, RemoteFingerprint,
    RemoteStore, UploadBatch,
};
pub use session::SyncSession;
pub use state::{DownloadSyncState, SyncStateContainer, SyncStatePublisher, UploadSyncState};
pub use upload::{UploadDriver, UploadOutcome};
