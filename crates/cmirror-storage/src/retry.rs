//! Bounded retry with exponential backoff for content source calls.
//!
//! Only [`FetchError::Unavailable`] is retried. A call that exceeds the
//! per-attempt timeout counts as unavailable.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::source::FetchError;

/// Upper bound on a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least 1)
    pub attempts: u32,
    /// Delay after the first failure; doubled after each further failure
    pub base_delay: Duration,
    /// Per-attempt deadline
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    pub fn from_hydration(cfg: &cmirror_core::config::HydrationConfig) -> Self {
        Self {
            attempts: cfg.read_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry_backoff_ms),
            timeout: (cfg.read_timeout_ms > 0).then(|| Duration::from_millis(cfg.read_timeout_ms)),
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. `call` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut call: F) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match policy.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, call(attempt)).await {
                Ok(r) => r,
                Err(_) => Err(FetchError::Unavailable(format!(
                    "{what}: timed out after {deadline:?}"
                ))),
            },
            None => call(attempt).await,
        };

        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                warn!(what, attempt, attempts, ?delay, "transient failure, retrying: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
