//! # Circuit Breaker Configuration
//!
//! Per-breaker thresholds and presets. File-based configuration lives in
//! [`crate::config::CircuitBreakerSettings`] and converts into this type.

use crate::error::{ResilienceError, ResilienceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures (within the rolling window) that, relative to
    /// `minimum_calls_to_trip`, define the tripping failure ratio
    pub failure_threshold: u32,

    /// Minimum call volume in the rolling window before the breaker may trip
    pub minimum_calls_to_trip: u32,

    /// Time to wait in open state before allowing a trial call
    pub reset_timeout: Duration,

    /// Trailing interval over which failures and volume are counted
    pub rolling_count_window: Duration,

    /// Deadline applied to every protected call; a timeout counts as a failure
    pub timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create configuration for database operations
    pub fn for_database() -> Self {
        Self {
            failure_threshold: 5,
            minimum_calls_to_trip: 10,
            reset_timeout: Duration::from_secs(30),
            rolling_count_window: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        }
    }

    /// Create configuration for queue operations
    pub fn for_queue() -> Self {
        Self {
            failure_threshold: 3,
            minimum_calls_to_trip: 5,
            reset_timeout: Duration::from_secs(15),
            rolling_count_window: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }

    /// Create configuration for external API calls
    pub fn for_external_api() -> Self {
        Self {
            failure_threshold: 5,
            minimum_calls_to_trip: 10,
            reset_timeout: Duration::from_secs(45),
            rolling_count_window: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }

    /// Failure ratio at or above which the breaker trips
    pub fn failure_ratio_threshold(&self) -> f64 {
        f64::from(self.failure_threshold) / f64::from(self.minimum_calls_to_trip.max(1))
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> ResilienceResult<()> {
        let invalid = |msg: &str| Err(ResilienceError::InvalidConfiguration(msg.to_string()));

        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be greater than 0");
        }
        if self.minimum_calls_to_trip == 0 {
            return invalid("minimum_calls_to_trip must be greater than 0");
        }
        if self.failure_threshold > self.minimum_calls_to_trip {
            return invalid("failure_threshold must not exceed minimum_calls_to_trip");
        }
        if self.reset_timeout.is_zero() {
            return invalid("reset_timeout must be greater than 0");
        }
        if self.rolling_count_window.is_zero() {
            return invalid("rolling_count_window must be greater than 0");
        }
        if self.timeout.is_zero() {
            return invalid("timeout must be greater than 0");
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            minimum_calls_to_trip: 10,
            reset_timeout: Duration::from_secs(30),
            rolling_count_window: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}
