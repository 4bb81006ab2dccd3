//! # Circuit Breaker Metrics
//!
//! Snapshot types for a single breaker and for the whole registry.

use super::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that reached the protected operation
    pub total_calls: u64,
    pub success_count: u64,
    /// Failures including timeouts
    pub failure_count: u64,
    /// Calls that exceeded the per-call deadline
    pub timeout_count: u64,
    /// Calls rejected without execution while open
    pub rejected_count: u64,
    /// Times the breaker transitioned to open
    pub opened_count: u64,
    /// Failures inside the rolling window
    pub rolling_failures: u64,
    /// Calls inside the rolling window
    pub rolling_volume: u64,
    pub total_duration: Duration,
    pub current_state: CircuitState,
    /// Lifetime failure rate (0.0 to 1.0)
    pub failure_rate: f64,
    /// Lifetime success rate (0.0 to 1.0)
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            rejected_count: 0,
            opened_count: 0,
            rolling_failures: 0,
            rolling_volume: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Failure ratio inside the rolling window
    pub fn rolling_failure_rate(&self) -> f64 {
        if self.rolling_volume == 0 {
            return 0.0;
        }
        self.rolling_failures as f64 / self.rolling_volume as f64
    }

    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.rolling_failure_rate() < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing system health",
        }
    }

    pub fn format_summary(&self) -> String {
        format!(
            "State: {} | Calls: {} | Success: {:.1}% | Failures: {} | Rejected: {} | Avg Duration: {}ms",
            self.state_description(),
            self.total_calls,
            self.success_rate * 100.0,
            self.failure_count,
            self.rejected_count,
            self.average_duration.as_millis()
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry-wide circuit breaker metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
    pub collected_at: chrono::DateTime<chrono::Utc>,
}

impl SystemCircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            circuit_breakers: HashMap::new(),
            collected_at: chrono::Utc::now(),
        }
    }

    pub fn add_circuit_breaker(&mut self, name: String, metrics: CircuitBreakerMetrics) {
        self.circuit_breakers.insert(name, metrics);
        self.collected_at = chrono::Utc::now();
    }

    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        let mut counts = HashMap::new();
        for metrics in self.circuit_breakers.values() {
            *counts.entry(metrics.current_state).or_insert(0) += 1;
        }
        counts
    }

    pub fn unhealthy_circuits(&self) -> Vec<(&String, &CircuitBreakerMetrics)> {
        self.circuit_breakers
            .iter()
            .filter(|(_, metrics)| !metrics.is_healthy())
            .collect()
    }

    /// Fraction of healthy breakers (1.0 when there are none)
    pub fn health_score(&self) -> f64 {
        if self.circuit_breakers.is_empty() {
            return 1.0;
        }

        let healthy_count = self
            .circuit_breakers
            .values()
            .filter(|metrics| metrics.is_healthy())
            .count();

        healthy_count as f64 / self.circuit_breakers.len() as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.total_calls).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.failure_count).sum()
    }

    pub fn format_summary(&self) -> String {
        let state_counts = self.count_by_state();
        let count = |state| state_counts.get(&state).copied().unwrap_or(0);

        format!(
            "Circuit Breakers: {} total | {} closed | {} open | {} half-open | Health: {:.1}%",
            self.circuit_breakers.len(),
            count(CircuitState::Closed),
            count(CircuitState::Open),
            count(CircuitState::HalfOpen),
            self.health_score() * 100.0
        )
    }
}

impl Default for SystemCircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
