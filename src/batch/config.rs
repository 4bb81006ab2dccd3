//! Batch manager configuration.

use crate::error::{ResilienceError, ResilienceResult};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when `process_batch` fails for a whole group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandlingStrategy {
    /// Reject every item of the group with the batch error
    #[default]
    FailFast,
    /// Fall back to `process_item` per item when the processor supports it
    Continue,
    /// Same fallback as `Continue`, recording each item failure for `collected_errors()`
    CollectErrors,
}

impl ErrorHandlingStrategy {
    pub fn falls_back_to_items(&self) -> bool {
        !matches!(self, ErrorHandlingStrategy::FailFast)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Dispatch immediately once this many items are queued
    pub max_batch_size: usize,
    /// Wait timer started by the first item of an empty batch
    pub max_wait_time: Duration,
    /// Soft floor a timer-triggered dispatch must reach
    pub min_batch_size: usize,
    /// Groups allowed in flight at once
    pub concurrency: usize,
    pub error_handling: ErrorHandlingStrategy,
    /// Results map to items by position. Only `true` is supported.
    pub preserve_order: bool,
    /// Oldest-item age after which a timer dispatch ignores `min_batch_size`
    pub max_queue_age: Option<Duration>,
    /// Deadline for a single `process_batch` call
    pub batch_timeout: Option<Duration>,
    /// Retry failed `process_batch` calls before applying `error_handling`
    pub retry: Option<RetryConfig>,
}

impl BatchConfig {
    pub fn validate(&self) -> ResilienceResult<()> {
        let invalid = |message: &str| Err(ResilienceError::InvalidConfiguration(message.to_string()));

        if self.max_batch_size == 0 {
            return invalid("max_batch_size must be greater than 0");
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return invalid("min_batch_size must be between 1 and max_batch_size");
        }
        if self.max_wait_time.is_zero() {
            return invalid("max_wait_time must be greater than 0");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be greater than 0");
        }
        if !self.preserve_order {
            return invalid("preserve_order = false is not supported");
        }
        if self.max_queue_age.is_some_and(|age| age.is_zero()) {
            return invalid("max_queue_age must be greater than 0 when set");
        }
        if self.batch_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return invalid("batch_timeout must be greater than 0 when set");
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait_time: Duration::from_millis(100),
            min_batch_size: 1,
            concurrency: 1,
            error_handling: ErrorHandlingStrategy::FailFast,
            preserve_order: true,
            max_queue_age: None,
            batch_timeout: None,
            retry: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(BatchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_bounds() {
        let config = BatchConfig {
            min_batch_size: 11,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BatchConfig {
            preserve_order: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BatchConfig {
            retry: Some(RetryConfig {
                max_attempts: 0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_names() {
        let strategy: ErrorHandlingStrategy = serde_json::from_str("\"collect-errors\"").unwrap();
        assert_eq!(strategy, ErrorHandlingStrategy::CollectErrors);
        assert!(strategy.falls_back_to_items());
        assert!(!ErrorHandlingStrategy::FailFast.falls_back_to_items());
    }
}
