//! Bounded retry for store serialization failures and deadlocks
//!
//! Only errors the store reports as lock contention are retried. Everything
//! else is returned to the caller on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use sea_orm::DbErr;
use tracing::warn;

/// Error fragments that identify a retryable store conflict
const TRANSIENT_MARKERS: &[&str] = &[
    "40P01",
    "40001",
    "deadlock",
    "could not serialize access",
    "database is locked",
    "database table is locked",
];

/// Retry bounds for transient store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `base * 2^(n-1)` plus up to `base` of jitter
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..base_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

/// True when `err` is a deadlock or serialization failure worth retrying
pub fn is_transient(err: &DbErr) -> bool {
    let message = err.to_string();
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| message.contains(marker) || lower.contains(&marker.to_lowercase()))
}

/// Run `op` until it succeeds, fails with a non-transient error, or the policy is exhausted
///
/// `label` identifies the row being touched in logs.
pub async fn with_transient_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, DbErr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbErr>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_transient(&err) => {
                let delay = policy.jittered_backoff(attempt);
                warn!(
                    target_row = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient store conflict, retrying: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
