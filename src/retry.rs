//! Bounded retry with exponential backoff for transient adapter failures.

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        RetryPolicy { max_attempts: max_attempts.max(1), ..Default::default() }
    }
}

/// Invoke `f` up to `policy.max_attempts` times. Only errors classified as
/// transient (`AppError::is_transient`) are retried; anything else aborts
/// immediately. Sleeps `initial_delay * backoff^(n-1)` between tries.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, op: &str, mut f: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;

    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.is_transient() => {
                tracing::warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:.1}s",
                    op,
                    attempt,
                    attempts,
                    e,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(policy.backoff);
            }
            Err(e) => {
                if attempt == attempts {
                    tracing::error!("{}: giving up after {} attempts: {}", op, attempts, e);
                }
                return Err(e);
            }
        }
    }

    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient(msg: &str) -> AppError {
        AppError::Llm { message: msg.into(), transient: true }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(
            RetryPolicy { max_attempts: 3, initial_delay: Duration::from_millis(10), backoff: 2.0 },
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(transient("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_when_attempts_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            RetryPolicy { max_attempts: 3, initial_delay: Duration::from_millis(1), backoff: 2.0 },
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient("always down")) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_error_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(RetryPolicy::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::IntentParse("malformed".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
