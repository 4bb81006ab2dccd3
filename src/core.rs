//! # Resilience Core
//!
//! Single bootstrap path that turns a [`ResilienceConfig`] into wired
//! primitives. One [`TimeoutManager`], one [`CircuitBreakerRegistry`] and one
//! [`EventSink`] are shared by every batch manager and stream processor
//! created through the core, so timeout statistics and breaker state cover
//! the whole process.

use crate::batch::{BatchManager, BatchProcessor, BatchRegistry};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::config::{ConfigManager, ConfigResult, ResilienceConfig};
use crate::error::ResilienceResult;
use crate::events::{default_sink, EventSink};
use crate::logging::log_resilience_operation;
use crate::retry::RetryPolicy;
use crate::stream::StreamProcessor;
use crate::timeout::TimeoutManager;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub struct ResilienceCore {
    config: Arc<ResilienceConfig>,
    timeouts: TimeoutManager,
    circuit_breakers: CircuitBreakerRegistry,
    events: Arc<dyn EventSink>,
}

impl ResilienceCore {
    /// Load configuration for the detected environment and bootstrap from it
    pub fn new() -> ConfigResult<Self> {
        let manager = ConfigManager::load()?;
        Ok(Self::from_config(manager.config())?)
    }

    pub fn from_config(config: &ResilienceConfig) -> ResilienceResult<Self> {
        Self::with_event_sink(config, default_sink())
    }

    /// Bootstrap with a caller-chosen event sink.
    ///
    /// Starts the periodic timeout sweep when `timeouts.cleanup_interval_ms`
    /// is set, which requires a tokio runtime.
    pub fn with_event_sink(
        config: &ResilienceConfig,
        events: Arc<dyn EventSink>,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        info!(
            environment = %config.environment,
            "Initializing resilience core"
        );

        let timeouts =
            TimeoutManager::with_event_sink(config.timeouts.to_timeout_config(), Arc::clone(&events));
        timeouts.start_periodic_cleanup();

        let circuit_breakers =
            CircuitBreakerRegistry::from_settings(&config.circuit_breakers, Arc::clone(&events));

        Ok(Self {
            config: Arc::new(config.clone()),
            timeouts,
            circuit_breakers,
            events,
        })
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.circuit_breakers
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.events)
    }

    /// Breaker for `component`, configured from `circuit_breakers.component_configs`
    pub fn circuit_breaker(&self, component: &str) -> Arc<CircuitBreaker> {
        self.circuit_breakers.get_circuit_breaker(component)
    }

    /// Batch manager using the `batch` section. When `batch.retry_batches` is
    /// set, failed groups are retried with the root `retry` settings.
    pub fn batch_manager<P: BatchProcessor>(
        &self,
        name: impl Into<String>,
        processor: P,
    ) -> ResilienceResult<BatchManager<P>> {
        let mut batch_config = self.config.batch.to_batch_config();
        if self.config.batch.retry_batches {
            batch_config.retry = Some(self.config.retry.to_retry_config());
        }
        BatchManager::with_timeout_manager(name, batch_config, processor, self.timeouts.clone())
    }

    /// Per-call-site registry sharing this core's batch settings and timeouts
    pub fn batch_registry<P: BatchProcessor>(&self) -> BatchRegistry<P> {
        let mut batch_config = self.config.batch.to_batch_config();
        if self.config.batch.retry_batches {
            batch_config.retry = Some(self.config.retry.to_retry_config());
        }
        BatchRegistry::new(batch_config, self.timeouts.clone())
    }

    pub fn stream_processor(&self) -> ResilienceResult<StreamProcessor> {
        Ok(StreamProcessor::with_timeout_manager(
            self.config.stream.to_stream_config(),
            self.timeouts.clone(),
        )?
        .with_event_sink(Arc::clone(&self.events)))
    }

    pub fn retry_policy<E>(&self) -> RetryPolicy<E> {
        RetryPolicy::new(self.config.retry.to_retry_config())
    }

    /// Abort every tracked timeout and stop the periodic sweep.
    ///
    /// Batch managers created from this core should be shut down first so
    /// their queued items are rejected rather than timed out.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.timeouts.shutdown();
        let breakers = self.circuit_breakers.get_system_metrics().format_summary();
        log_resilience_operation(
            "core",
            "shutdown",
            "completed",
            Some(&format!("cancelled_timeouts={cancelled} | {breakers}")),
        );
        cancelled
    }
}

impl fmt::Debug for ResilienceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceCore")
            .field("environment", &self.config.environment)
            .field("timeouts", &self.timeouts)
            .field("circuit_breakers", &self.circuit_breakers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::batch_fn;
    use crate::circuit_breaker::CircuitState;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.environment = "test".to_string();
        config.batch.max_batch_size = 2;
        config.batch.max_wait_time_ms = 10;
        config.retry.base_delay_ms = 10;
        config.retry.max_delay_ms = Some(10);
        config.timeouts.cleanup_interval_ms = None;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_batches_applies_root_retry_settings() {
        let mut config = config();
        config.batch.retry_batches = true;
        let core = ResilienceCore::from_config(&config).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let processor = {
            let calls = Arc::clone(&calls);
            batch_fn(move |items: Vec<u32>| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("connection reset by peer");
                    }
                    Ok(items)
                }
            })
        };

        let manager = core.batch_manager("retrying", processor).unwrap();
        assert_eq!(manager.config().retry, Some(config.retry.to_retry_config()));

        let (a, b) = tokio::join!(manager.add(1), manager.add(2));
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_processor_shares_the_timeout_manager() {
        let mut config = config();
        config.stream.item_timeout_ms = Some(50);
        let core = ResilienceCore::from_config(&config).unwrap();
        let processor = core.stream_processor().unwrap();

        let results = processor.process_with_error_handler(
            futures::stream::iter(vec![1u64, 100]),
            |delay, _, _| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(delay)
            },
            |_, _, _| true,
        );
        let values: Vec<_> = results.collect().await;
        assert_eq!(values.len(), 1);

        let stats = core.timeouts().get_stats();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.timed_out, 1);
    }

    #[tokio::test]
    async fn test_component_overrides_reach_the_registry() {
        let mut config = config();
        config
            .circuit_breakers
            .component_configs
            .insert("ledger".to_string(), Default::default());
        config
            .circuit_breakers
            .component_configs
            .get_mut("ledger")
            .unwrap()
            .failure_threshold = 1;
        let core = ResilienceCore::from_config(&config).unwrap();

        let breaker = core.circuit_breaker("ledger");
        assert_eq!(breaker.config().failure_threshold, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(core.retry_policy::<anyhow::Error>().config().max_attempts, 3);
        assert_eq!(core.shutdown(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.stream.concurrency = 0;
        assert!(ResilienceCore::from_config(&config).is_err());
    }
}
