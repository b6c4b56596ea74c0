//! Full-jitter exponential backoff for transient store errors.
//!
//! Transaction conflicts are not retried here — those are the acquire
//! engine's concern (its own, separate retry budget). This module only
//! covers throttling and connection resets that a `StoreGateway`
//! implementation retries internally before ever surfacing an error.

use std::time::Duration;

use rand::Rng;

/// Caps the number of attempts and the total wall-clock budget spent
/// retrying one logical store operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
            deadline: Duration::from_secs(5),
        }
    }
}

/// Full-jitter backoff: `sleep = random(0, min(max_delay, base_delay * 2^attempt))`.
/// `attempt` is zero-based (the delay before the *first* retry, i.e. after
/// the 0th failed attempt, uses `attempt = 0`).
#[must_use]
pub fn full_jitter_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.base_delay.as_millis().saturating_mul(1u128 << attempt.min(20));
    let capped = exp.min(policy.max_delay.as_millis());
    if capped == 0 {
        return Duration::ZERO;
    }
    let jittered = rand::rng().random_range(0..=capped);
    Duration::from_millis(jittered as u64)
}

/// Runs `op` with full-jitter retry until it succeeds, `should_retry`
/// returns `false` for the error, `max_attempts` is exhausted, or the
/// cumulative elapsed time exceeds `deadline`.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut should_retry: impl FnMut(&E) -> bool, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = should_retry(&err);
                attempt += 1;
                if !retryable || attempt >= policy.max_attempts || start.elapsed() >= policy.deadline {
                    return Err(err);
                }
                tokio::time::sleep(full_jitter_delay(policy, attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_max_delay() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        for attempt in 0..10 {
            let d = full_jitter_delay(&policy, attempt);
            assert!(d <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };
        let mut calls = 0;
        let result: Result<i32, &str> = retry_with_backoff(
            &policy,
            |_| true,
            || {
                calls += 1;
                let attempt = calls;
                async move { if attempt < 3 { Err("transient") } else { Ok(42) } }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn stops_when_should_retry_is_false() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<i32, &str> = retry_with_backoff(
            &policy,
            |_| false,
            || {
                calls += 1;
                async { Err("permanent") }
            },
        )
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };
        let mut calls = 0;
        let result: Result<i32, &str> = retry_with_backoff(&policy, |_| true, || {
            calls += 1;
            async { Err("transient") }
        })
        .await;
        assert_eq!(result, Err("transient"));
        assert_eq!(calls, 3);
    }
}
