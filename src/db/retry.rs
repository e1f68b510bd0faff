//! Retry combinator
//!
//! `retry(max_attempts, operation, classifier, backoff, on_retry)` runs
//! `operation` until it succeeds, fails with an error the classifier rejects,
//! or runs out of attempts. Attempt numbers start at 1.

use std::future::Future;
use std::time::Duration;

/// Executor backoff: 1000ms after attempt 1, 2000ms after attempt 2, ...
pub fn linear_backoff(attempt: u32) -> Duration {
    Duration::from_millis(1000 * attempt as u64)
}

/// Warm-up backoff: min(1000 * 2^(attempt-1), 5000) ms
pub fn capped_exponential_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((1000u64 << exp).min(5000))
}

/// Run `operation` with bounded retries.
///
/// * `operation(attempt)` - one attempt; it must re-acquire anything it needs
/// * `is_retryable` - errors it rejects propagate immediately
/// * `backoff(attempt)` - wait after a failed `attempt` before the next one
/// * `on_retry(attempt, &error)` - runs before the wait (pool reset, logging)
pub async fn retry<T, E, Op, Fut, C, B, R>(
    max_attempts: u32,
    mut operation: Op,
    is_retryable: C,
    backoff: B,
    mut on_retry: R,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    B: Fn(u32) -> Duration,
    R: FnMut(u32, &E),
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                on_retry(attempt, &e);
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
