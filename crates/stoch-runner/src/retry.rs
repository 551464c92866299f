use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{EngineError, RetryExhausted};

/// Longest single sleep between two attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Bounded exponential backoff applied to every engine operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Sleep after failed attempt `attempt` (1-indexed):
    /// `retry_delay * retry_backoff^(attempt - 1)`.
    /// Capped at [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let secs = self.delay_secs(attempt);
        if secs >= MAX_RETRY_DELAY.as_secs_f64() {
            return MAX_RETRY_DELAY;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_DELAY)
    }

    /// Uncapped delay in seconds; may be infinite.
    fn delay_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.retry_delay.as_secs_f64() * self.retry_backoff.powi(exponent)
    }

    /// Sleep before the last attempt, `None` when it exceeds
    /// [`MAX_RETRY_DELAY`].
    pub fn largest_delay(&self) -> Option<Duration> {
        if self.max_retries < 2 || self.retry_delay.is_zero() {
            return Some(Duration::ZERO);
        }
        let secs = self.delay_secs(self.max_retries - 1);
        (secs <= MAX_RETRY_DELAY.as_secs_f64()).then(|| self.delay_for(self.max_retries - 1))
    }

    pub fn run<T, F>(&self, operation: &str, op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Result<T, EngineError>,
    {
        self.run_with_sleep(operation, op, thread::sleep)
    }

    /// Like [`RetryPolicy::run`] with an injectable sleep.
    pub fn run_with_sleep<T, F, S>(
        &self,
        operation: &str,
        mut op: F,
        mut sleep: S,
    ) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Result<T, EngineError>,
        S: FnMut(Duration),
    {
        let attempts = self.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_s = delay.as_secs_f64(),
                        error = %err,
                        "operation failed, retrying"
                    );
                    sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(RetryExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: err,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc_error() -> EngineError {
        EngineError::Calc {
            region: "U11:V11".to_string(),
            detail: "#VALUE!".to_string(),
        }
    }

    #[test]
    fn delay_grows_geometrically_from_base() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_delay: Duration::from_millis(500),
            retry_backoff: 3.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4500));
    }

    #[test]
    fn always_failing_operation_sleeps_between_attempts_only() {
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
        };
        let mut sleeps = Vec::new();
        let mut calls = 0;
        let err = policy
            .run_with_sleep(
                "sim 0",
                |_| -> Result<(), EngineError> {
                    calls += 1;
                    Err(calc_error())
                },
                |d| sleeps.push(d),
            )
            .expect_err("must exhaust");
        assert_eq!(calls, 3);
        assert_eq!(sleeps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.source, calc_error());
    }

    #[test]
    fn success_after_transient_failures_returns_value() {
        let policy = RetryPolicy {
            max_retries: 4,
            retry_delay: Duration::from_millis(10),
            retry_backoff: 2.0,
        };
        let mut sleeps = Vec::new();
        let value = policy
            .run_with_sleep(
                "set policy",
                |attempt| {
                    if attempt < 3 {
                        Err(calc_error())
                    } else {
                        Ok(attempt * 10)
                    }
                },
                |d| sleeps.push(d),
            )
            .expect("third attempt succeeds");
        assert_eq!(value, 30);
        assert_eq!(
            sleeps,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[test]
    fn single_attempt_policy_never_sleeps() {
        let policy = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        let mut slept = false;
        let err = policy
            .run_with_sleep(
                "open",
                |_| -> Result<(), EngineError> { Err(EngineError::Open("locked".into())) },
                |_| slept = true,
            )
            .expect_err("fails");
        assert!(!slept);
        assert_eq!(err.attempts, 1);
    }

    #[test]
    fn huge_backoff_is_capped_instead_of_overflowing() {
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 1.0e300,
        };
        assert_eq!(policy.delay_for(2), MAX_RETRY_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), MAX_RETRY_DELAY);
        assert_eq!(policy.largest_delay(), None);

        let mut sleeps = Vec::new();
        let err = policy
            .run_with_sleep(
                "simulation 4",
                |_| -> Result<(), EngineError> { Err(calc_error()) },
                |d| sleeps.push(d),
            )
            .expect_err("exhausts without panicking");
        assert_eq!(err.attempts, 3);
        assert_eq!(sleeps, vec![Duration::from_secs(1), MAX_RETRY_DELAY]);

        let moderate = RetryPolicy {
            max_retries: 25,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 10.0,
        };
        assert_eq!(moderate.delay_for(25), MAX_RETRY_DELAY);
        assert_eq!(RetryPolicy::default().largest_delay(), Some(Duration::from_secs(2)));
    }
}
