use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

use crate::error::StoreError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// `base * 2^(attempts_used - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempts_used: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempts_used.saturating_sub(1));
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    fn sleep_for(&self, attempts_used: u32) -> Duration {
        let delay = self.backoff_delay(attempts_used);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let max_jitter_ms = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
        delay.saturating_add(Duration::from_millis(jitter_ms))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent.
pub async fn retry_async<T, O, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: O,
) -> Result<T, StoreError>
where
    O: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) if attempts >= max_attempts => {
                if attempts == 1 {
                    return Err(error);
                }
                return Err(StoreError::RetryExhausted {
                    operation: operation_name.to_owned(),
                    attempts,
                    last_error: Box::new(error),
                });
            }
            Err(error) => {
                let delay = policy.sleep_for(attempts);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "store call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
