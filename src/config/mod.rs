//! # Resilience Configuration
//!
//! File-facing configuration mirroring `config/resilience.yaml`. Every section
//! uses integer millisecond fields and converts into the `Duration`-typed runtime
//! configuration owned by the corresponding module.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_resilience::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let batch = manager.config().batch.to_batch_config();
//! println!("max batch size: {}", batch.max_batch_size);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::batch::{BatchConfig, ErrorHandlingStrategy};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ResilienceResult;
use crate::retry::{BackoffStrategy, RetryConfig};
use crate::stream::StreamConfig;
use crate::timeout::TimeoutManagerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn optional_millis(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

/// Root configuration structure mirroring resilience.yaml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Environment the configuration was loaded for
    pub environment: String,
    pub retry: RetrySettings,
    pub circuit_breakers: CircuitBreakerSettings,
    pub batch: BatchSettings,
    pub timeouts: TimeoutSettings,
    pub stream: StreamSettings,
}

impl ResilienceConfig {
    /// Validate every section, reporting the first failure
    pub fn validate(&self) -> ResilienceResult<()> {
        self.retry.to_retry_config().validate()?;
        self.circuit_breakers.validate()?;
        self.batch.to_batch_config().validate()?;
        self.timeouts.to_timeout_config().validate()?;
        self.stream.to_stream_config().validate()?;
        Ok(())
    }
}

/// Retry section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: Option<u64>,
    pub strategy: BackoffStrategy,
    pub jitter: bool,
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: millis(self.base_delay_ms),
            max_delay: optional_millis(self.max_delay_ms),
            strategy: self.strategy,
            jitter: self.jitter,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: Some(30_000),
            strategy: BackoffStrategy::Exponential,
            jitter: false,
        }
    }
}

/// Circuit breaker section: global limits, defaults and per-component overrides
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub max_circuit_breakers: usize,
    pub default_config: CircuitBreakerComponentSettings,
    pub component_configs: HashMap<String, CircuitBreakerComponentSettings>,
}

impl CircuitBreakerSettings {
    /// Runtime configuration for a component, falling back to the default
    pub fn config_for_component(&self, component_name: &str) -> CircuitBreakerConfig {
        self.component_configs
            .get(component_name)
            .unwrap_or(&self.default_config)
            .to_resilience_config()
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_circuit_breakers == 0 {
            return Err(crate::error::ResilienceError::InvalidConfiguration(
                "max_circuit_breakers must be greater than 0".to_string(),
            ));
        }
        self.default_config.to_resilience_config().validate()?;
        for settings in self.component_configs.values() {
            settings.to_resilience_config().validate()?;
        }
        Ok(())
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_circuit_breakers: 50,
            default_config: CircuitBreakerComponentSettings::default(),
            component_configs: HashMap::new(),
        }
    }
}

/// Thresholds for one breaker as written in the file
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerComponentSettings {
    pub failure_threshold: u32,
    pub minimum_calls_to_trip: u32,
    pub reset_timeout_ms: u64,
    pub rolling_count_window_ms: u64,
    pub timeout_ms: u64,
}

impl CircuitBreakerComponentSettings {
    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            minimum_calls_to_trip: self.minimum_calls_to_trip,
            reset_timeout: millis(self.reset_timeout_ms),
            rolling_count_window: millis(self.rolling_count_window_ms),
            timeout: millis(self.timeout_ms),
        }
    }
}

impl Default for CircuitBreakerComponentSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            minimum_calls_to_trip: defaults.minimum_calls_to_trip,
            reset_timeout_ms: defaults.reset_timeout.as_millis() as u64,
            rolling_count_window_ms: defaults.rolling_count_window.as_millis() as u64,
            timeout_ms: defaults.timeout.as_millis() as u64,
        }
    }
}

/// Batch manager section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub max_wait_time_ms: u64,
    pub min_batch_size: usize,
    pub concurrency: usize,
    pub error_handling: ErrorHandlingStrategy,
    pub preserve_order: bool,
    pub max_queue_age_ms: Option<u64>,
    pub batch_timeout_ms: Option<u64>,
    /// Retry `process_batch` with the root retry settings
    pub retry_batches: bool,
}

impl BatchSettings {
    pub fn to_batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_wait_time: millis(self.max_wait_time_ms),
            min_batch_size: self.min_batch_size,
            concurrency: self.concurrency,
            error_handling: self.error_handling,
            preserve_order: self.preserve_order,
            max_queue_age: optional_millis(self.max_queue_age_ms),
            batch_timeout: optional_millis(self.batch_timeout_ms),
            retry: None,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        let defaults = BatchConfig::default();
        Self {
            max_batch_size: defaults.max_batch_size,
            max_wait_time_ms: defaults.max_wait_time.as_millis() as u64,
            min_batch_size: defaults.min_batch_size,
            concurrency: defaults.concurrency,
            error_handling: defaults.error_handling,
            preserve_order: defaults.preserve_order,
            max_queue_age_ms: None,
            batch_timeout_ms: None,
            retry_batches: false,
        }
    }
}

/// Timeout manager section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub default_timeout_ms: u64,
    /// Interval of the stale-operation sweep; absent disables it
    pub cleanup_interval_ms: Option<u64>,
    pub stale_grace_period_ms: u64,
}

impl TimeoutSettings {
    pub fn to_timeout_config(&self) -> TimeoutManagerConfig {
        TimeoutManagerConfig {
            default_timeout: millis(self.default_timeout_ms),
            cleanup_interval: optional_millis(self.cleanup_interval_ms),
            stale_grace_period: millis(self.stale_grace_period_ms),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let defaults = TimeoutManagerConfig::default();
        Self {
            default_timeout_ms: defaults.default_timeout.as_millis() as u64,
            cleanup_interval_ms: defaults.cleanup_interval.map(|d| d.as_millis() as u64),
            stale_grace_period_ms: defaults.stale_grace_period.as_millis() as u64,
        }
    }
}

/// Stream processor section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    pub concurrency: usize,
    pub item_timeout_ms: Option<u64>,
    pub stream_timeout_ms: Option<u64>,
    pub memory_threshold_mb: u64,
    pub backpressure_delay_ms: u64,
    pub max_backpressure_delay_ms: u64,
    pub memory_check_interval: usize,
}

impl StreamSettings {
    pub fn to_stream_config(&self) -> StreamConfig {
        StreamConfig {
            concurrency: self.concurrency,
            item_timeout: optional_millis(self.item_timeout_ms),
            stream_timeout: optional_millis(self.stream_timeout_ms),
            memory_threshold_mb: self.memory_threshold_mb,
            backpressure_delay: millis(self.backpressure_delay_ms),
            max_backpressure_delay: millis(self.max_backpressure_delay_ms),
            memory_check_interval: self.memory_check_interval,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        let defaults = StreamConfig::default();
        Self {
            concurrency: defaults.concurrency,
            item_timeout_ms: defaults.item_timeout.map(|d| d.as_millis() as u64),
            stream_timeout_ms: defaults.stream_timeout.map(|d| d.as_millis() as u64),
            memory_threshold_mb: defaults.memory_threshold_mb,
            backpressure_delay_ms: defaults.backpressure_delay.as_millis() as u64,
            max_backpressure_delay_ms: defaults.max_backpressure_delay.as_millis() as u64,
            memory_check_interval: defaults.memory_check_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ResilienceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
batch:
  max_batch_size: 25
  error_handling: collect-errors
stream:
  memory_threshold_mb: 256
"#;
        let config: ResilienceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.batch.max_batch_size, 25);
        assert_eq!(
            config.batch.error_handling,
            ErrorHandlingStrategy::CollectErrors
        );
        assert_eq!(config.batch.min_batch_size, BatchConfig::default().min_batch_size);
        assert_eq!(config.stream.memory_threshold_mb, 256);
        assert_eq!(config.retry, RetrySettings::default());
    }

    #[test]
    fn test_component_lookup_falls_back_to_default() {
        let mut settings = CircuitBreakerSettings::default();
        settings.component_configs.insert(
            "ledger".to_string(),
            CircuitBreakerComponentSettings {
                failure_threshold: 3,
                ..Default::default()
            },
        );

        assert_eq!(settings.config_for_component("ledger").failure_threshold, 3);
        assert_eq!(
            settings.config_for_component("unknown"),
            CircuitBreakerConfig::default()
        );
    }

    #[test]
    fn test_invalid_section_is_reported() {
        let mut config = ResilienceConfig::default();
        config.batch.max_batch_size = 0;
        assert!(config.validate().is_err());
    }
}
