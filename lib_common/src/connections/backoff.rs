//! # Retry With Exponential Backoff
//!
//! Connection attempts against the broker are retried with a delay that
//! doubles after each failure up to a ceiling, plus a random jitter so that
//! several relays restarting together do not reconnect in lockstep. The
//! attempt budget is bounded: once it is spent, the last error is returned
//! to the caller.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// # Retry Policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Ceiling for the exponential part of the wait.
    pub max_delay: Duration,
    /// Total attempts, including the first. `0` is treated as `1`.
    pub max_attempts: u32,
    /// Upper bound (exclusive) of the random jitter added to every wait.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            max_jitter: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    /// The attempt budget, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait before the next attempt after `failures` consecutive failures,
    /// without jitter: `min(initial * 2^(failures - 1), max_delay)`.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// A random jitter in `[0, max_jitter)`.
    pub fn jitter(&self) -> Duration {
        let bound = self.max_jitter.as_micros() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..bound))
    }

    /// `base_delay(failures) + jitter()`.
    pub fn delay_with_jitter(&self, failures: u32) -> Duration {
        self.base_delay(failures) + self.jitter()
    }
}

/// # Retry an Async Operation
///
/// Calls `operation` until it succeeds or `policy.attempts()` calls have
/// failed. Every attempt and every failure is logged under `label`, with the
/// attempt number and the error.
///
/// # Errors
/// The error of the final attempt once the budget is exhausted.
pub async fn retry_async<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        log::info!("{}: attempt {}/{}", label, attempt, attempts);

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("{}: succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt >= attempts => {
                log::error!("{}: attempt {}/{} failed: {}. Giving up.", label, attempt, attempts, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_with_jitter(attempt);
                log::warn!(
                    "{}: attempt {}/{} failed: {}. Retrying in {} ms",
                    label,
                    attempt,
                    attempts,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_attempts: u32, max_jitter: Duration) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts,
            max_jitter,
        }
    }

    #[test]
    fn base_delay_doubles_up_to_the_ceiling() {
        let policy = policy(10, Duration::ZERO);
        let delays: Vec<u128> = (1..=6).map(|n| policy.base_delay(n).as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn base_delay_saturates_for_huge_failure_counts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(u32::MAX), policy.max_delay);
        assert_eq!(policy.base_delay(64), policy.max_delay);
    }

    #[test]
    fn jitter_stays_below_the_bound() {
        let policy = RetryPolicy::default();
        for n in 1..200 {
            let delay = policy.delay_with_jitter(n % 8 + 1);
            let base = policy.base_delay(n % 8 + 1);
            assert!(delay >= base);
            assert!(delay < base + Duration::from_millis(300));
        }
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(policy(0, Duration::ZERO).attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exactly_max_attempts() {
        let policy = policy(4, Duration::ZERO);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let result: Result<(), String> = retry_async(&policy, "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().unwrap().push(start.elapsed());
                Err("refused".to_string())
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "refused");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        // Waits of 100, 200 and 400 ms between the four attempts.
        for (pair, expected) in calls.windows(2).zip([100u64, 200, 400]) {
            let wait = pair[1] - pair[0];
            assert!(wait >= Duration::from_millis(expected), "wait {wait:?} < {expected} ms");
            assert!(wait < Duration::from_millis(expected + 5), "wait {wait:?} > {expected} ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_include_bounded_jitter() {
        let policy = policy(3, Duration::from_millis(300));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let _: Result<(), &str> = retry_async(&policy, "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().unwrap().push(Instant::now());
                Err("refused")
            }
        })
        .await;

        let calls = calls.lock().unwrap();
        let first_wait = calls[1] - calls[0];
        let second_wait = calls[2] - calls[1];
        assert!(first_wait >= Duration::from_millis(100) && first_wait < Duration::from_millis(400));
        assert!(second_wait >= Duration::from_millis(200) && second_wait < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let policy = policy(5, Duration::ZERO);
        let attempts = Arc::new(Mutex::new(0u32));

        let value = retry_async(&policy, "test", || {
            let attempts = Arc::clone(&attempts);
            async move {
                let mut n = attempts.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    Err("not yet")
                } else {
                    Ok(*n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(*attempts.lock().unwrap(), 3);
    }
}
