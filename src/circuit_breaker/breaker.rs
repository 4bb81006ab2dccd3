//! # Circuit Breaker Implementation
//!
//! Three-state fault isolation: Closed (normal operation), Open (failing fast),
//! and Half-Open (a single trial call tests recovery).
//!
//! Outcomes are counted over a rolling window. The breaker trips once the window
//! holds at least `minimum_calls_to_trip` calls and the failure ratio reaches
//! `failure_threshold / minimum_calls_to_trip`. Open-to-half-open happens lazily:
//! the first state query or call after `reset_timeout` performs the transition.

use super::{CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::error::ResilienceError;
use crate::events::{publish_isolated, EventSink, ResilienceEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - one trial call allowed at a time
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not invoked
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation exceeded the per-call deadline and was recorded as a failure
    #[error("Operation timed out after {}ms in {component}", timeout.as_millis())]
    Timeout {
        component: String,
        timeout: Duration,
    },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }

    /// The wrapped operation's own error, if that is what failed
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            CircuitBreakerError::OperationFailed(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_resilience_error(self) -> ResilienceError
    where
        E: Into<anyhow::Error>,
    {
        match self {
            CircuitBreakerError::CircuitOpen { component } => {
                ResilienceError::CircuitOpen { component }
            }
            CircuitBreakerError::Timeout { component, timeout } => {
                ResilienceError::timeout(component, timeout)
            }
            CircuitBreakerError::OperationFailed(err) => ResilienceError::upstream(err),
        }
    }
}

/// Outcome of a registry-level protected call
#[derive(Debug)]
pub struct PatternResult<T, E> {
    pub result: Result<T, CircuitBreakerError<E>>,
    pub duration: Duration,
    /// Breaker state after the call settled
    pub state: CircuitState,
}

impl<T, E> PatternResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn data(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&CircuitBreakerError<E>> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, CircuitBreakerError<E>> {
        self.result
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// (completed_at, failed)
    window: VecDeque<(Instant, bool)>,
    total_calls: u64,
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    rejected_count: u64,
    opened_count: u64,
    total_duration: Duration,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            trial_in_flight: false,
            window: VecDeque::new(),
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            rejected_count: 0,
            opened_count: 0,
            total_duration: Duration::ZERO,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn rolling_counts(&self) -> (u64, u64) {
        let failures = self.window.iter().filter(|(_, failed)| *failed).count() as u64;
        (failures, self.window.len() as u64)
    }
}

enum Admission {
    Allowed { trial: bool },
    Rejected,
}

/// Circuit breaker guarding a single named dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self::with_event_sink(name, config, crate::events::default_sink())
    }

    pub fn with_event_sink(
        name: String,
        config: CircuitBreakerConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            minimum_calls_to_trip = config.minimum_calls_to_trip,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner::new()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, performing the open to half-open transition if due
    pub fn state(&self) -> CircuitState {
        let (state, event) = {
            let mut inner = self.inner.lock();
            let event = self.refresh(&mut inner, Instant::now());
            (inner.state, event)
        };
        self.emit(event);
        state
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = match self.admit() {
            Admission::Allowed { trial } => trial,
            Admission::Rejected => {
                debug!(component = %self.name, "Call rejected, circuit open");
                return Err(CircuitBreakerError::CircuitOpen {
                    component: self.name.clone(),
                });
            }
        };

        let mut guard = TrialGuard {
            breaker: self,
            trial,
            settled: false,
        };

        let start_time = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout, operation()).await;
        let duration = start_time.elapsed();
        guard.settled = true;

        match outcome {
            Ok(Ok(value)) => {
                self.record(duration, Outcome::Success, trial);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record(duration, Outcome::Failure, trial);
                Err(CircuitBreakerError::OperationFailed(err))
            }
            Err(_) => {
                warn!(
                    component = %self.name,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Protected call timed out"
                );
                self.record(duration, Outcome::Timeout, trial);
                Err(CircuitBreakerError::Timeout {
                    component: self.name.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let event = {
            let mut inner = self.inner.lock();
            self.transition_to_open(&mut inner, Instant::now())
        };
        self.emit(event);
    }

    /// Reset to closed state, discarding the rolling window
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let event = {
            let mut inner = self.inner.lock();
            self.transition_to_closed(&mut inner)
        };
        self.emit(event);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.prune(now, self.config.rolling_count_window);
        let (rolling_failures, rolling_volume) = inner.rolling_counts();

        let (failure_rate, success_rate) = if inner.total_calls > 0 {
            (
                inner.failure_count as f64 / inner.total_calls as f64,
                inner.success_count as f64 / inner.total_calls as f64,
            )
        } else {
            (0.0, 0.0)
        };

        let average_duration = if inner.total_calls > 0 {
            inner.total_duration / inner.total_calls.min(u64::from(u32::MAX)) as u32
        } else {
            Duration::ZERO
        };

        CircuitBreakerMetrics {
            total_calls: inner.total_calls,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            timeout_count: inner.timeout_count,
            rejected_count: inner.rejected_count,
            opened_count: inner.opened_count,
            rolling_failures,
            rolling_volume,
            total_duration: inner.total_duration,
            current_state: inner.state,
            failure_rate,
            success_rate,
            average_duration,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed && self.metrics().is_healthy()
    }

    fn admit(&self) -> Admission {
        let (admission, event) = {
            let mut inner = self.inner.lock();
            let event = self.refresh(&mut inner, Instant::now());
            let admission = match inner.state {
                CircuitState::Closed => Admission::Allowed { trial: false },
                CircuitState::Open => Admission::Rejected,
                CircuitState::HalfOpen if inner.trial_in_flight => Admission::Rejected,
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                }
            };
            if matches!(admission, Admission::Rejected) {
                inner.rejected_count += 1;
            }
            (admission, event)
        };
        self.emit(event);
        admission
    }

    fn record(&self, duration: Duration, outcome: Outcome, trial: bool) {
        let event = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let failed = outcome != Outcome::Success;

            inner.total_calls += 1;
            inner.total_duration += duration;
            match outcome {
                Outcome::Success => inner.success_count += 1,
                Outcome::Failure => inner.failure_count += 1,
                Outcome::Timeout => {
                    inner.failure_count += 1;
                    inner.timeout_count += 1;
                }
            }
            inner.window.push_back((now, failed));
            inner.prune(now, self.config.rolling_count_window);

            match inner.state {
                CircuitState::HalfOpen if trial => {
                    inner.trial_in_flight = false;
                    if failed {
                        self.transition_to_open(&mut inner, now)
                    } else {
                        self.transition_to_closed(&mut inner)
                    }
                }
                // Every outcome can bring the window up to the volume floor
                CircuitState::Closed => {
                    let (failures, volume) = inner.rolling_counts();
                    let ratio = failures as f64 / volume.max(1) as f64;
                    if volume >= u64::from(self.config.minimum_calls_to_trip)
                        && ratio >= self.config.failure_ratio_threshold()
                    {
                        self.transition_to_open(&mut inner, now)
                    } else {
                        None
                    }
                }
                // Late completions admitted before the last transition
                _ => None,
            }
        };
        self.emit(event);
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) -> Option<ResilienceEvent> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        if now.saturating_duration_since(opened_at) >= self.config.reset_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            Some(ResilienceEvent::BreakerHalfOpened {
                component: self.name.clone(),
            })
        } else {
            None
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerInner, now: Instant) -> Option<ResilienceEvent> {
        let (failures, volume) = inner.rolling_counts();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.opened_count += 1;
        Some(ResilienceEvent::BreakerOpened {
            component: self.name.clone(),
            failures,
            volume,
        })
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner) -> Option<ResilienceEvent> {
        let was_closed = inner.state == CircuitState::Closed;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.window.clear();
        if was_closed {
            None
        } else {
            Some(ResilienceEvent::BreakerClosed {
                component: self.name.clone(),
            })
        }
    }

    /// Publish a transition event. Must be called after the state lock is released.
    fn emit(&self, event: Option<ResilienceEvent>) {
        if let Some(event) = event {
            info!(
                component = %self.name,
                transition = event.name(),
                summary = %self.metrics().format_summary(),
                "Circuit breaker state changed"
            );
            publish_isolated(self.events.as_ref(), event);
        }
    }

    fn abandon_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Frees the half-open trial slot when a call is dropped before settling
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            minimum_calls_to_trip: 4,
            reset_timeout: Duration::from_millis(100),
            rolling_count_window: Duration::from_secs(10),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config());
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_does_not_trip_below_volume_floor() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config());

        for _ in 0..3 {
            let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Closed);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    fn threshold_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            minimum_calls_to_trip: 10,
            ..test_config()
        }
    }

    async fn assert_next_call_rejected(circuit: &CircuitBreaker) {
        let invoked = AtomicU32::new(0);
        let result = circuit
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trips_when_successes_reach_volume_floor() {
        let circuit = CircuitBreaker::new("test".to_string(), threshold_config());

        for _ in 0..5 {
            let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        }
        for _ in 0..4 {
            let _ = circuit.call(|| async { Ok::<_, String>(()) }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Closed);

        let _ = circuit.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_next_call_rejected(&circuit).await;
    }

    #[tokio::test]
    async fn test_trips_on_interleaved_failures() {
        let circuit = CircuitBreaker::new("test".to_string(), threshold_config());

        for n in 0..10 {
            if n % 2 == 0 {
                let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
            } else {
                let _ = circuit.call(|| async { Ok::<_, String>(()) }).await;
            }
        }
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_next_call_rejected(&circuit).await;
    }

    #[tokio::test]
    async fn test_stays_closed_below_failure_ratio() {
        let circuit = CircuitBreaker::new("test".to_string(), threshold_config());

        for _ in 0..4 {
            let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        }
        for _ in 0..6 {
            let _ = circuit.call(|| async { Ok::<_, String>(()) }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().rolling_volume, 10);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_operation() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config());
        circuit.force_open();

        let invoked = AtomicU32::new(0);
        let result = circuit
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(circuit.metrics().rejected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config());
        circuit.force_open();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let result = circuit.call(|| async { Ok::<_, String>("recovered") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config());
        circuit.force_open();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let _ = circuit.call(|| async { Err::<(), _>("still down") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.metrics().opened_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig {
            timeout: Duration::from_millis(50),
            ..test_config()
        };
        let circuit = CircuitBreaker::new("slow".to_string(), config);

        let result = circuit
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        let metrics = circuit.metrics();
        assert_eq!(metrics.timeout_count, 1);
        assert_eq!(metrics.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_forgets_old_failures() {
        let config = CircuitBreakerConfig {
            rolling_count_window: Duration::from_millis(500),
            ..test_config()
        };
        let circuit = CircuitBreaker::new("window".to_string(), config);

        for _ in 0..3 {
            let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().rolling_volume, 1);
    }

    #[tokio::test]
    async fn test_force_operations() {
        let circuit = CircuitBreaker::new("test".to_string(), test_config());

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
