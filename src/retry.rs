//! Bounded retry with exponential backoff and jitter.
//!
//! Used for writes that must land once a side effect has already happened,
//! such as recording `spec.curatingJob` after the curation Job was created.
//! Retries stop early when the caller classifies an error as permanent.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff settings for a retried operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Run `operation` until it succeeds, the error is permanent, or attempts run out.
///
/// `is_retryable` decides whether an error is worth another attempt. The last
/// error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt = attempt.saturating_add(1);

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_retryable(&err) {
            warn!(
                operation = %operation_name,
                attempt,
                error = %err,
                "operation failed with a permanent error"
            );
            return Err(err);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "operation failed after max retries"
            );
            return Err(err);
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis() as u64,
            "operation failed, retrying"
        );

        tokio::time::sleep(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn first_success_is_returned() {
        let result: Result<&str, &str> =
            retry_with_backoff(&fast(3), "record", |_| true, || async { Ok("done") }).await;
        assert_eq!(result, Ok("done"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<u32, &str> = retry_with_backoff(&fast(5), "record", |_| true, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("conflict")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), &str> = retry_with_backoff(&fast(3), "record", |_| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("still failing")
            }
        })
        .await;

        assert_eq!(result, Err("still failing"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), &str> =
            retry_with_backoff(&fast(10), "record", |e| *e != "gone", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("gone")
                }
            })
            .await;

        assert_eq!(result, Err("gone"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
