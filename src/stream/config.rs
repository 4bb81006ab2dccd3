//! Stream processor configuration.

use crate::error::{ResilienceError, ResilienceResult};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Items processed at the same time
    pub concurrency: usize,
    /// Deadline for a single item, enforced through the timeout manager
    pub item_timeout: Option<Duration>,
    /// Deadline for the whole run
    pub stream_timeout: Option<Duration>,
    /// Resident memory above which admission slows down
    pub memory_threshold_mb: u64,
    /// Admission delay at the threshold; grows with the overage
    pub backpressure_delay: Duration,
    pub max_backpressure_delay: Duration,
    /// Memory is sampled once every this many admitted items
    pub memory_check_interval: usize,
}

impl StreamConfig {
    pub fn validate(&self) -> ResilienceResult<()> {
        let invalid = |message: &str| Err(ResilienceError::InvalidConfiguration(message.to_string()));

        if self.concurrency == 0 {
            return invalid("concurrency must be greater than 0");
        }
        if self.item_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return invalid("item_timeout must be greater than 0 when set");
        }
        if self.stream_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return invalid("stream_timeout must be greater than 0 when set");
        }
        if self.memory_threshold_mb == 0 {
            return invalid("memory_threshold_mb must be greater than 0");
        }
        if self.max_backpressure_delay < self.backpressure_delay {
            return invalid("max_backpressure_delay must be at least backpressure_delay");
        }
        if self.memory_check_interval == 0 {
            return invalid("memory_check_interval must be greater than 0");
        }
        Ok(())
    }

    /// Admission delay for a memory sample while backpressure is active.
    ///
    /// Scales linearly from `backpressure_delay` by ten times the fractional
    /// overage, capped at `max_backpressure_delay`.
    pub fn backpressure_delay_for(&self, used_mb: u64) -> Duration {
        let overage = used_mb.saturating_sub(self.memory_threshold_mb) as f64
            / self.memory_threshold_mb as f64;
        self.backpressure_delay
            .mul_f64(1.0 + overage * 10.0)
            .min(self.max_backpressure_delay)
    }

    /// Usage below which active backpressure is released
    pub fn release_threshold_mb(&self) -> f64 {
        self.memory_threshold_mb as f64 * 0.8
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            item_timeout: None,
            stream_timeout: None,
            memory_threshold_mb: 512,
            backpressure_delay: Duration::from_millis(100),
            max_backpressure_delay: Duration::from_secs(5),
            memory_check_interval: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(StreamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let config = StreamConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StreamConfig {
            backpressure_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_delay_scales_with_overage() {
        let config = StreamConfig {
            memory_threshold_mb: 100,
            backpressure_delay: Duration::from_millis(100),
            max_backpressure_delay: Duration::from_secs(1),
            ..Default::default()
        };

        assert_eq!(config.backpressure_delay_for(90), Duration::from_millis(100));
        assert_eq!(config.backpressure_delay_for(100), Duration::from_millis(100));
        // 10% over: 100ms * (1 + 0.1 * 10)
        assert_eq!(config.backpressure_delay_for(110), Duration::from_millis(200));
        assert_eq!(config.backpressure_delay_for(400), Duration::from_secs(1));
        assert_eq!(config.release_threshold_mb(), 80.0);
    }
}
