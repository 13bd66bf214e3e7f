//! Retry policy for polling server artifacts that appear asynchronously

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry with exponential backoff.
///
/// Used for error-log polling only; transport failures are never retried
/// by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Exponential backoff base (e.g., 2.0 for doubling)
    pub backoff_factor: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for LogRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
            jitter: false,
        }
    }
}

impl LogRetryPolicy {
    /// Try exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delay
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            initial_delay_ms: ms,
            max_delay_ms: ms,
            backoff_factor: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait before attempt number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay_ms as f64
            * self.backoff_factor.powi(attempt.saturating_sub(1) as i32);

        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            capped_delay * (1.0 + rand_jitter() * 0.25)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay / 1000.0)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

/// Generate a random jitter factor between 0.0 and 1.0
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}
