//! Sync session configuration.

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Per-session sync tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum retries for a failed network operation before the error
    /// state sticks.
    pub max_retries: u32,
    /// Retry timing.
    pub backoff: BackoffPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_roundtrip() {
        let config = SyncConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_retries, config.max_retries);
        assert_eq!(parsed.backoff.factor, config.backoff.factor);
    }
}
