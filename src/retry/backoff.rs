//! # Delay Calculator
//!
//! Pure mapping from (attempt, strategy) to the wait before the next attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter perturbs the computed delay uniformly within ±25%
pub const JITTER_RATIO: f64 = 0.25;

/// Backoff strategy mapping attempt number to wait duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * 2^(attempt - 1)`
    #[default]
    Exponential,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Fixed => write!(f, "fixed"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

/// Calculate the delay before retrying after `attempt` (1-based) failed.
///
/// The cap is applied before jitter; the result is truncated to whole milliseconds.
pub fn calculate_delay(
    attempt: u32,
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter: bool,
) -> Duration {
    if jitter {
        calculate_delay_with_sample(
            attempt,
            strategy,
            base_delay,
            max_delay,
            rand::random::<f64>(),
        )
    } else {
        truncate_millis(capped_delay_ms(attempt, strategy, base_delay, max_delay))
    }
}

/// Jittered delay for a uniform `sample` in `[0, 1)`; 0.5 yields the nominal delay
pub fn calculate_delay_with_sample(
    attempt: u32,
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Option<Duration>,
    sample: f64,
) -> Duration {
    let delay_ms = capped_delay_ms(attempt, strategy, base_delay, max_delay);
    let factor = 1.0 + (sample.clamp(0.0, 1.0) * 2.0 - 1.0) * JITTER_RATIO;
    truncate_millis(delay_ms * factor)
}

fn capped_delay_ms(
    attempt: u32,
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Option<Duration>,
) -> f64 {
    let attempt = attempt.max(1);
    let base_ms = base_delay.as_millis() as f64;

    let raw = match strategy {
        BackoffStrategy::Fixed => base_ms,
        BackoffStrategy::Linear => base_ms * f64::from(attempt),
        BackoffStrategy::Exponential => base_ms * 2f64.powi((attempt - 1).min(1023) as i32),
    };

    match max_delay {
        Some(max) => raw.min(max.as_millis() as f64),
        None => raw,
    }
}

fn truncate_millis(delay_ms: f64) -> Duration {
    if !delay_ms.is_finite() {
        return Duration::from_millis(u64::MAX);
    }
    Duration::from_millis(delay_ms.max(0.0).trunc() as u64)
}
