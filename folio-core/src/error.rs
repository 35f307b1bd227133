//! Error taxonomy shared across the page store.

use thiserror::Error;

/// Result type for page store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the page store.
///
/// Local storage failures abort the current operation but leave the page
/// usable; network failures are retried by the sync engine and only
/// surfaced through sync-state watchers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Journal is no longer valid (already committed or rolled back)")]
    InvalidJournal,

    #[error("Merge was cancelled before completion")]
    MergeCancelled,

    #[error("Remote fingerprint mismatch: the remote store was reset or recreated")]
    FingerprintMismatch,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the sync engine may retry the failed operation.
    ///
    /// Only transient network failures are retryable. A fingerprint
    /// mismatch in particular must never be retried into; the owner has
    /// to decide on remediation first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("timeout".to_string()).is_retryable());
        assert!(!Error::FingerprintMismatch.is_retryable());
        assert!(!Error::InvalidJournal.is_retryable());
        assert!(!Error::NotFound("x".to_string()).is_retryable());
    }
}
