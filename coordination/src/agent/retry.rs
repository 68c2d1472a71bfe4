//! Bounded retry with exponential backoff for transport calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::EngineSettings;
use crate::error::ArenaResult;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base: Duration,
    /// Upper bound (exclusive) of the uniform jitter added to each wait.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(2),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base: Duration::from_secs_f64(settings.backoff_base_secs),
            ..Self::default()
        }
    }

    /// Wait before retrying after zero-based `attempt` failed:
    /// `base * 2^attempt` plus jitter in `[0, max_jitter)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            self.max_jitter
                .mul_f64(rand::thread_rng().gen_range(0.0..1.0))
        };
        exp + jitter
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// budget runs out. The last error is returned on exhaustion.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> ArenaResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ArenaResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let wait = policy.backoff(attempt);
                warn!(
                    request = what,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    backoff_secs = wait.as_secs_f64(),
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
