//! Retry with exponential backoff for device commands.
//!
//! Every attempt is bounded by a timeout and reported to the device's
//! [`CircuitBreaker`]. Retrying stops early once the breaker opens so the
//! command can wait in the queue for the device to come back.

use std::future::Future;
use std::time::Duration;

use quotagate_policy::DeviceId;
use rand::Rng;

use crate::circuitbreaker::{CircuitBreaker, CircuitState};
use crate::error::{EnforceError, Result};

/// Backoff and timeout settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any delay.
    pub max_backoff: Duration,
    /// Growth factor per retry.
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter to each delay.
    pub jitter: bool,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64;
        let max_ms = self.max_backoff.as_millis() as f64;
        let capped = (base_ms * self.backoff_multiplier.powi(attempt as i32)).min(max_ms) as u64;

        if self.jitter && capped > 1 {
            let jitter = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter))
        } else {
            Duration::from_millis(capped)
        }
    }

    /// Runs `operation` against `device`, retrying transient failures.
    ///
    /// Success and failure of every attempt are recorded on `breaker`. Returns the
    /// last error when retries are exhausted, the error is permanent, or the
    /// breaker opened.
    pub async fn execute<F, Fut, T>(
        &self,
        device: DeviceId,
        breaker: &CircuitBreaker,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(EnforceError::Timeout {
                    device,
                    timeout_ms: self.attempt_timeout.as_millis() as u64,
                }),
            };

            let error = match result {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(error);
            }
            if breaker.record_failure() {
                tracing::warn!(%device, error = %error, "device marked offline");
            }
            if breaker.state() != CircuitState::Closed || attempt > self.max_retries {
                return Err(error);
            }

            let delay = self.backoff(attempt - 1);
            tracing::debug!(%device, attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying command");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Returns true for failures worth retrying: unreachable devices and timeouts.
pub fn is_retryable(error: &EnforceError) -> bool {
    match error {
        EnforceError::Unreachable { .. } => true,
        EnforceError::Timeout { .. } => true,
        EnforceError::Rejected { .. } => false,
        EnforceError::Unsupported { .. } => false,
        EnforceError::UnknownDevice(_) => false,
        EnforceError::ShutDown => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuitbreaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
            attempt_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn unreachable() -> EnforceError {
        EnforceError::Unreachable {
            device: DeviceId::new(1),
            reason: "no route".to_string(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(10), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            jitter: true,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.backoff(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&unreachable()));
        assert!(is_retryable(&EnforceError::Timeout {
            device: DeviceId::new(1),
            timeout_ms: 10
        }));
        assert!(!is_retryable(&EnforceError::Rejected {
            device: DeviceId::new(1),
            reason: "bad queue".to_string()
        }));
        assert!(!is_retryable(&EnforceError::UnknownDevice(DeviceId::new(1))));
        assert!(!is_retryable(&EnforceError::ShutDown));
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let breaker = CircuitBreaker::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = quick(3)
            .execute(DeviceId::new(1), &breaker, move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                        Err(unreachable())
                    } else {
                        Ok("acked")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("acked"));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_error() {
        let breaker = CircuitBreaker::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result: Result<()> = quick(2)
            .execute(DeviceId::new(1), &breaker, move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(unreachable())
                }
            })
            .await;

        assert_eq!(result, Err(unreachable()));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert_eq!(breaker.failure_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let breaker = CircuitBreaker::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result: Result<()> = quick(5)
            .execute(DeviceId::new(1), &breaker, move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(EnforceError::Rejected {
                        device: DeviceId::new(1),
                        reason: "bad queue".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(EnforceError::Rejected { .. })));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_stops_when_breaker_opens() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            open_duration: Duration::from_secs(30),
        });
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result: Result<()> = quick(10)
            .execute(DeviceId::new(1), &breaker, move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(unreachable())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let breaker = CircuitBreaker::default();
        let result: Result<()> = quick(0)
            .execute(DeviceId::new(4), &breaker, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(
            result,
            Err(EnforceError::Timeout {
                device: DeviceId::new(4),
                timeout_ms: 50
            })
        );
    }
}
