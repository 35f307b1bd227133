//! Device fingerprints.
//!
//! The fingerprint is an opaque token identifying this device. Every
//! device syncing against a remote registers its fingerprint in the
//! remote's device set; any number of devices share one remote. If a
//! fingerprint this device registered earlier is later absent from the
//! set, the remote was reset or recreated and merging against it would
//! corrupt local history. That condition is surfaced as a non-retryable
//! error, never resolved silently.

use rand::RngCore;
use std::sync::Arc;
use tracing::{info, warn};

use folio_core::{Error, PageDb, Result};

use crate::remote::{FingerprintCheck, RemoteFingerprint};

const FINGERPRINT_KEY: &[u8] = b"sync/fingerprint";
const REGISTERED_KEY: &[u8] = b"sync/fingerprint_registered";
const FINGERPRINT_SIZE: usize = 16;

/// Opaque token identifying the local device's view of remote history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint(Vec<u8>);

impl DeviceFingerprint {
    /// Generate a fresh random fingerprint.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; FINGERPRINT_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Load the locally persisted fingerprint, creating one on first use.
pub async fn load_or_create(db: &Arc<dyn PageDb>) -> Result<DeviceFingerprint> {
    if let Some(bytes) = db.get(FINGERPRINT_KEY).await? {
        return Ok(DeviceFingerprint::from_bytes(bytes.to_vec()));
    }
    let fingerprint = DeviceFingerprint::generate();
    db.put(FINGERPRINT_KEY, fingerprint.as_bytes()).await?;
    info!("created device fingerprint");
    Ok(fingerprint)
}

/// Gate that must pass before any sync: check this device's fingerprint
/// against the remote's device set, registering it on first contact.
///
/// A fingerprint this device registered earlier that is now absent from
/// the set means the remote was reset; it is reported to the owner as
/// [`Error::FingerprintMismatch`] for explicit remediation.
pub async fn check_or_set(
    db: &Arc<dyn PageDb>,
    remote: &dyn RemoteFingerprint,
) -> Result<DeviceFingerprint> {
    let fingerprint = load_or_create(db).await?;
    match remote.check_fingerprint(fingerprint.as_bytes()).await? {
        FingerprintCheck::Match => Ok(fingerprint),
        FingerprintCheck::NotSet => {
            if db.get(REGISTERED_KEY).await?.is_some() {
                warn!("fingerprint registered earlier is gone from the remote device set");
                return Err(Error::FingerprintMismatch);
            }
            remote.set_fingerprint(fingerprint.as_bytes()).await?;
            db.put(REGISTERED_KEY, &[]).await?;
            info!("registered device fingerprint with remote");
            Ok(fingerprint)
        }
        FingerprintCheck::Mismatch => {
            warn!("remote reports a different fingerprint for this device");
            Err(Error::FingerprintMismatch)
        }
    }
}

/// Clear the local sync identity. The owner calls this as remediation
/// after an explicit decision to adopt the reset remote.
pub async fn reset_local(db: &Arc<dyn PageDb>) -> Result<()> {
    db.delete(FINGERPRINT_KEY).await?;
    db.delete(REGISTERED_KEY).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FakeRemote;
    use folio_core::MemoryDb;

    fn db() -> Arc<dyn PageDb> {
        Arc::new(MemoryDb::new())
    }

    #[tokio::test]
    async fn test_first_sync_sets_remote_fingerprint() {
        let db = db();
        let remote = FakeRemote::new();
        let fp = check_or_set(&db, &remote).await.unwrap();
        assert_eq!(
            remote.check_fingerprint(fp.as_bytes()).await.unwrap(),
            FingerprintCheck::Match
        );
    }

    #[tokio::test]
    async fn test_fingerprint_is_stable_across_sessions() {
        let db = db();
        let remote = FakeRemote::new();
        let first = check_or_set(&db, &remote).await.unwrap();
        let second = check_or_set(&db, &remote).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_second_device_joins_same_remote() {
        let remote = FakeRemote::new();
        let db_a = db();
        let db_b = db();

        let fp_a = check_or_set(&db_a, &remote).await.unwrap();
        let fp_b = check_or_set(&db_b, &remote).await.unwrap();
        assert_ne!(fp_a, fp_b);

        // Both stay registered on subsequent checks.
        assert_eq!(check_or_set(&db_a, &remote).await.unwrap(), fp_a);
        assert_eq!(check_or_set(&db_b, &remote).await.unwrap(), fp_b);
    }

    #[tokio::test]
    async fn test_remote_reset_is_a_mismatch_error() {
        let db = db();
        let remote = FakeRemote::new();
        check_or_set(&db, &remote).await.unwrap();

        // Remote recreated by another party; the device set is gone.
        remote.clear_fingerprints();

        assert!(matches!(
            check_or_set(&db, &remote).await,
            Err(Error::FingerprintMismatch)
        ));
    }

    #[tokio::test]
    async fn test_reset_local_allows_fresh_start() {
        let db = db();
        let remote = FakeRemote::new();
        check_or_set(&db, &remote).await.unwrap();
        remote.clear_fingerprints();
        assert!(check_or_set(&db, &remote).await.is_err());

        // Owner decides to start over against the reset remote.
        reset_local(&db).await.unwrap();
        assert!(check_or_set(&db, &remote).await.is_ok());
    }
}
