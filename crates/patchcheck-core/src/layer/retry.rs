//! Bounded retry with exponential backoff for transient build failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::BuildError;

/// Retry settings for build steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Run `op`, retrying transient failures up to `policy.max_retries` times.
///
/// Non-transient errors are returned immediately. When retries run out the
/// final transient error carries the number of attempts made.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, step: &str, mut op: F) -> Result<T, BuildError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BuildError>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(BuildError::Transient {
                step: failed_step,
                detail,
                ..
            }) => {
                if attempt >= max_attempts {
                    return Err(BuildError::Transient {
                        step: failed_step,
                        attempts: attempt,
                        detail,
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    event = "build.retry",
                    step = %step,
                    failed_step = %failed_step,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient build failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}
