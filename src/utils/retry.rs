// src/utils/retry.rs
use log::debug;
use std::future::Future;
use std::time::Duration;

use crate::utils::merge_config::MergeConfig;

/// A bounded number of attempts with a fixed pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// No pause between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            attempts: config.poll_attempts,
            delay: Duration::from_millis(config.poll_delay_ms),
        }
    }

    /// Retries for the executor's final job-state write.
    pub fn for_writes(config: &MergeConfig) -> Self {
        Self {
            attempts: config.write_retry_attempts.max(1),
            delay: Duration::from_millis(config.write_retry_delay_ms),
        }
    }
}

/// Runs `check` up to `policy.attempts` times, sleeping `policy.delay`
/// between attempts, and returns the first `Some`. Errors stop the loop.
pub async fn poll_until<T, E, F, Fut>(policy: RetryPolicy, mut check: F) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 1..=policy.attempts {
        if let Some(value) = check(attempt).await? {
            return Ok(Some(value));
        }
        debug!("Poll attempt {}/{} not ready", attempt, policy.attempts);
        if attempt < policy.attempts && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
    }
    Ok(None)
}
