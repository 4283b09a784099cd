//! Bounded exponential backoff for broker calls
//!
//! Every attempt carries its own timeout. A timed-out attempt is reported as
//! ambiguous and never retried: the request may have reached the broker.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::ExecutionConfig;
use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Randomisation applied to each delay (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_retries: 4,
            jitter_factor: 0.1,
        }
    }
}

impl From<&ExecutionConfig> for BackoffConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            max_retries: config.max_retries,
            ..Default::default()
        }
    }
}

pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
    current_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            attempt: 0,
            config,
        }
    }

    /// Next delay, or `None` once the retry budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }

        let delay = self.with_jitter(self.current_delay);
        self.attempt += 1;
        self.current_delay = std::cmp::min(
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier),
            self.config.max_delay,
        );
        Some(delay)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor == 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen::<f64>() * self.config.jitter_factor;
        let multiplier = 1.0 + (jitter - self.config.jitter_factor / 2.0);
        Duration::from_secs_f64(delay.as_secs_f64() * multiplier)
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt
    }
}

/// Backoff plus the per-attempt timeout
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: BackoffConfig,
    pub timeout: Duration,
}

impl From<&ExecutionConfig> for RetryPolicy {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            backoff: BackoffConfig::from(config),
            timeout: config.broker_timeout(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Run a broker call, retrying transient failures only
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    instrument: &str,
    mut call: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut backoff = ExponentialBackoff::new(policy.backoff.clone());

    loop {
        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Ambiguous(format!(
                "{} timed out after {:?}",
                operation, policy.timeout
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(BrokerError::Transient(message)) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        instrument = %instrument,
                        operation,
                        attempt = backoff.attempt_number(),
                        "Transient broker error: {}, retrying in {:?}",
                        message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    let attempts = backoff.attempt_number() + 1;
                    tracing::error!(
                        instrument = %instrument,
                        operation,
                        attempts,
                        "Broker call failed after retries: {}",
                        message
                    );
                    return Err(RetryError::Exhausted {
                        attempts,
                        last: message,
                    });
                }
            },
            Err(e) => return Err(RetryError::Broker(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                max_retries,
                jitter_factor: 0.0,
                ..Default::default()
            },
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(25),
            max_retries: 4,
            jitter_factor: 0.0,
            ..Default::default()
        });
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(25)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(25)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = &AtomicU32::new(0);
        let result = call_with_retry(&fast_policy(3), "submit", "X", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BrokerError::Transient("reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&fast_policy(2), "submit", "X", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Transient("reset".into()))
        })
        .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&fast_policy(5), "submit", "X", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Rejected("insufficient balance".into()))
        })
        .await;
        assert!(matches!(result, Err(RetryError::Broker(BrokerError::Rejected(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_ambiguous_and_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&fast_policy(5), "submit", "X", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RetryError::Broker(BrokerError::Ambiguous(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
