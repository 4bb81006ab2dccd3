//! # Circuit Breaker Registry
//!
//! Named breakers created on first use. Component-specific configuration is
//! looked up from [`CircuitBreakerSettings`]; unknown names get the default.

use super::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, PatternResult, SystemCircuitBreakerMetrics,
};
use crate::config::CircuitBreakerSettings;
use crate::events::{publish_isolated, EventSink, ResilienceEvent};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Registry of circuit breakers keyed by component name
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    circuit_breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    settings: Arc<CircuitBreakerSettings>,
    events: Arc<dyn EventSink>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::from_settings(&CircuitBreakerSettings::default(), crate::events::default_sink())
    }

    pub fn from_settings(settings: &CircuitBreakerSettings, events: Arc<dyn EventSink>) -> Self {
        info!(
            component_overrides = settings.component_configs.len(),
            "Initializing circuit breaker registry"
        );

        Self {
            circuit_breakers: Arc::new(DashMap::new()),
            settings: Arc::new(settings.clone()),
            events,
        }
    }

    /// Get or create the breaker for a component (idempotent)
    pub fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(component_name, None)
    }

    /// Get or create a breaker, using `config` only if it has to be created.
    /// An invalid `config` is logged and replaced by the component settings.
    pub fn get_or_create(
        &self,
        component_name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.circuit_breakers.get(component_name) {
            return Arc::clone(existing.value());
        }

        if self.circuit_breakers.len() >= self.settings.max_circuit_breakers {
            warn!(
                component = component_name,
                current_count = self.circuit_breakers.len(),
                max_allowed = self.settings.max_circuit_breakers,
                "Maximum circuit breaker limit reached"
            );
        }

        let entry = self
            .circuit_breakers
            .entry(component_name.to_string())
            .or_insert_with(|| {
                let config = match config.map(|config| config.validate().map(|()| config)) {
                    Some(Ok(config)) => config,
                    Some(Err(error)) => {
                        warn!(
                            component = component_name,
                            error = %error,
                            "Rejected supplied circuit breaker config; using component settings"
                        );
                        self.settings.config_for_component(component_name)
                    }
                    None => self.settings.config_for_component(component_name),
                };
                info!(component = component_name, "Created new circuit breaker");
                Arc::new(CircuitBreaker::with_event_sink(
                    component_name.to_string(),
                    config,
                    Arc::clone(&self.events),
                ))
            });

        Arc::clone(entry.value())
    }

    /// Run `operation` through the named breaker and report the outcome
    pub async fn with_circuit_breaker<F, T, E, Fut>(
        &self,
        component_name: &str,
        operation: F,
        config: Option<CircuitBreakerConfig>,
    ) -> PatternResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_or_create(component_name, config);
        let started = Instant::now();
        let result = breaker.call(operation).await;

        PatternResult {
            result,
            duration: started.elapsed(),
            state: breaker.state(),
        }
    }

    pub fn list_components(&self) -> Vec<String> {
        self.circuit_breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn get_system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::new();
        for entry in self.circuit_breakers.iter() {
            system_metrics.add_circuit_breaker(entry.key().clone(), entry.value().metrics());
        }
        system_metrics
    }

    /// Reset one breaker to closed; returns false if it does not exist
    pub fn reset(&self, component_name: &str) -> bool {
        match self.circuit_breakers.get(component_name) {
            Some(breaker) => {
                breaker.force_closed();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker to closed (emergency recovery)
    pub fn reset_all(&self) {
        warn!("Forcing all circuit breakers closed");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }

    /// Drop a breaker from the registry; outstanding `Arc`s keep working independently
    pub fn remove_circuit_breaker(&self, component_name: &str) -> bool {
        match self.circuit_breakers.remove(component_name) {
            Some((name, breaker)) => {
                info!(
                    component = %name,
                    remaining_count = self.circuit_breakers.len(),
                    "Removed circuit breaker"
                );
                publish_isolated(
                    self.events.as_ref(),
                    ResilienceEvent::BreakerRemoved {
                        component: name,
                        last_state: breaker.state(),
                    },
                );
                true
            }
            None => false,
        }
    }

    pub fn get_state_summary(&self) -> HashMap<CircuitState, usize> {
        self.get_system_metrics().count_by_state()
    }

    pub fn system_health_score(&self) -> f64 {
        self.get_system_metrics().health_score()
    }

    pub fn len(&self) -> usize {
        self.circuit_breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuit_breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
