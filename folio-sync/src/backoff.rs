//! Exponential backoff for network retries.
//!
//! Backoff state is a value type owned by each sync session; it is
//! seeded explicitly from the session's config and never shared.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry timing parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Multiplicative growth factor between attempts.
    pub factor: u32,
    /// Cap on the computed delay (before jitter).
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2,
            max: Duration::from_secs(60),
        }
    }
}

/// Per-session retry clock.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt: `initial * factor^n` capped at
    /// `max`, plus up to 50% randomized jitter per attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.policy.factor.saturating_pow(self.attempt);
        let base = self
            .policy
            .initial
            .saturating_mul(exp)
            .min(self.policy.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_cap = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base.saturating_add(Duration::from_millis(jitter))
    }

    /// Number of attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
