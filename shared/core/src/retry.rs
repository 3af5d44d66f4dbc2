use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub const fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Exponential backoff with jitter: half of the doubled delay is fixed, the
    /// other half is random.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(retry.saturating_sub(1)));
        let jitter = rand::random::<u64>() % delay_ms.max(1);
        Duration::from_millis(delay_ms / 2 + jitter / 2)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(500))
    }
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects, or
/// the policy's attempts are used up. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "{what} failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            RetryPolicy::new(5, Duration::ZERO),
            "flaky op",
            |_| true,
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) }
            },
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            RetryPolicy::new(3, Duration::ZERO),
            "always failing op",
            |_| true,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            },
        )
        .await;
        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            RetryPolicy::new(10, Duration::ZERO),
            "auth op",
            |err: &String| err != "forbidden",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("forbidden".to_string())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_grows() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let first = policy.delay_for(1);
        let third = policy.delay_for(3);
        assert!(first >= Duration::from_millis(50) && first < Duration::from_millis(100));
        assert!(third >= Duration::from_millis(200) && third < Duration::from_millis(400));
        assert_eq!(RetryPolicy::no_retry().delay_for(1), Duration::ZERO);
    }
}
