//! Exponential backoff policy shared by every retrying component.
//!
//! The poller (vendor fetches), the persistence writer (transient database
//! errors), and the notification sink (delivery failures) all retry with the
//! same policy: base 1s, factor 2, jitter ±25%, cap 30s, at most 3 attempts.
//! This module only computes delays; callers own the sleep and the decision
//! of which errors are transient.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_ms: u64,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Jitter fraction; the delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub cap_ms: u64,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            jitter: 0.25,
            cap_ms: 30_000,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay to sleep before retry number `attempt` (1-based: attempt 1 is
    /// the first retry after the initial failure).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = self.base_ms as f64 * self.factor.powi(exponent as i32);
        let capped = raw.min(self.cap_ms as f64);
        let jittered = if self.jitter > 0.0 {
            let scale = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            capped * scale
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// True when another attempt is allowed after `attempts_made` attempts.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
