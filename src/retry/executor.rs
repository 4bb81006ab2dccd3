//! # Retry Executor
//!
//! Invokes a fallible async operation up to `max_attempts` times, consulting the
//! delay calculator and a retryability predicate between attempts. Failures are
//! reported through [`RetryOutcome`] rather than by panicking or throwing, so
//! callers branch on the result directly.

use super::backoff::{calculate_delay, BackoffStrategy};
use super::classifier::is_retryable_error;
use crate::error::{ResilienceError, ResilienceResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Retry tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    pub strategy: BackoffStrategy,
    pub jitter: bool,
}

impl RetryConfig {
    /// Network-oriented strategy used for remote service calls
    pub fn for_network() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(30)),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
        }
    }

    pub fn for_database() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Some(Duration::from_secs(5)),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
        }
    }

    /// Single attempt, no retry
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidConfiguration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(max_delay) = self.max_delay {
            if max_delay < self.base_delay {
                return Err(ResilienceError::InvalidConfiguration(format!(
                    "max_delay ({}ms) must not be smaller than base_delay ({}ms)",
                    max_delay.as_millis(),
                    self.base_delay.as_millis()
                )));
            }
        }
        Ok(())
    }

    /// Delay to wait after `attempt` failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_delay(
            attempt,
            self.strategy,
            self.base_delay,
            self.max_delay,
            self.jitter,
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Some(Duration::from_secs(30)),
            strategy: BackoffStrategy::Exponential,
            jitter: false,
        }
    }
}

type ShouldRetryFn<E> = Arc<dyn Fn(&E, u32) -> bool + Send + Sync>;
type OnRetryFn<E> = Arc<dyn Fn(&E, u32) + Send + Sync>;

/// Retry configuration plus the optional caller hooks
pub struct RetryPolicy<E> {
    config: RetryConfig,
    should_retry: Option<ShouldRetryFn<E>>,
    on_retry: Option<OnRetryFn<E>>,
}

impl<E> RetryPolicy<E> {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            should_retry: None,
            on_retry: None,
        }
    }

    /// Replace the default classifier. A panicking predicate counts as "not retryable".
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Observe every failed attempt. Panics are logged and swallowed.
    pub fn with_on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&E, u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            should_retry: self.should_retry.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl<E> From<RetryConfig> for RetryPolicy<E> {
    fn from(config: RetryConfig) -> Self {
        Self::new(config)
    }
}

/// Final result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts actually made, including the successful one
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }

    pub fn data(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&E> {
        self.result.as_ref().err()
    }
}

/// Run `operation` under `policy`.
///
/// The operation receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut>(mut operation: F, policy: &RetryPolicy<E>) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let max_attempts = policy.config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempts = attempt, "Operation succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    total_duration: started.elapsed(),
                };
            }
            Err(err) => {
                if let Some(hook) = &policy.on_retry {
                    if catch_unwind(AssertUnwindSafe(|| hook(&err, attempt))).is_err() {
                        error!(attempt = attempt, "on_retry hook panicked; continuing");
                    }
                }

                let retryable = match &policy.should_retry {
                    Some(predicate) => {
                        catch_unwind(AssertUnwindSafe(|| predicate(&err, attempt))).unwrap_or_else(
                            |_| {
                                error!(
                                    attempt = attempt,
                                    "should_retry predicate panicked; treating as not retryable"
                                );
                                false
                            },
                        )
                    }
                    None => is_retryable_error(&err),
                };

                if !retryable || attempt >= max_attempts {
                    warn!(
                        attempts = attempt,
                        max_attempts = max_attempts,
                        retryable = retryable,
                        error = %err,
                        "Operation failed, giving up"
                    );
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                        total_duration: started.elapsed(),
                    };
                }

                let delay = policy.config.delay_for(attempt);
                debug!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
