//! Bounded retries with exponential backoff for REST calls.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Attempt budget and backoff curve.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before retrying after the 1-based `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        let backoff = self
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff);
        backoff + jitter(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent. `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

fn jitter(max_jitter: Duration, attempt: usize) -> Duration {
    let limit = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit == 0 {
        return Duration::ZERO;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_nanos(mixed % (limit + 1))
}
