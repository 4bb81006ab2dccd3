//! # Timeout Manager
//!
//! Registry of every outstanding deadline-bounded operation. One manager is
//! constructed and shared (it is cheap to clone) by the batch managers and
//! stream processors that need timeouts, so tests get isolated instances.
//!
//! Operations live in a global map keyed by id and, when started inside a
//! [`TimeoutContext`], in that context's id set. Cleanup removes both entries.
//! All map mutation is synchronous; no lock is held across an `.await`.

use super::context::{ContextId, TimeoutContext};
use super::operation::{
    OperationId, OperationInfo, OperationState, TimeoutController, TimeoutFuture, TimeoutHandle,
    TimeoutOptions, TrackedOperation,
};
use super::stats::{MemoryFootprint, TimeoutCounters, TimeoutStats};
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::{publish_isolated, EventSink, ResilienceEvent};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runtime configuration for a [`TimeoutManager`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutManagerConfig {
    /// Deadline used by callers that do not pick their own
    pub default_timeout: Duration,
    /// Interval of the stale-operation sweep; `None` disables it
    pub cleanup_interval: Option<Duration>,
    /// How far past its deadline an operation may linger before the sweep aborts it
    pub stale_grace_period: Duration,
}

impl TimeoutManagerConfig {
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.default_timeout.is_zero() {
            return Err(ResilienceError::InvalidConfiguration(
                "default_timeout must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ResilienceError::InvalidConfiguration(
                "cleanup_interval must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TimeoutManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            cleanup_interval: Some(Duration::from_secs(60)),
            stale_grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct ContextEntry {
    name: String,
    operations: HashSet<OperationId>,
}

pub(crate) struct ManagerInner {
    config: TimeoutManagerConfig,
    operations: DashMap<OperationId, Arc<dyn TrackedOperation>>,
    contexts: DashMap<ContextId, ContextEntry>,
    counters: Arc<TimeoutCounters>,
    events: Arc<dyn EventSink>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ManagerInner {
    fn track(&self, operation: Arc<dyn TrackedOperation>, id: OperationId, context: Option<ContextId>) {
        self.operations.insert(id, operation);
        if let Some(context) = context {
            if let Some(mut entry) = self.contexts.get_mut(&context) {
                entry.operations.insert(id);
            }
        }
    }

    pub(crate) fn untrack(&self, id: OperationId, context: Option<ContextId>) {
        self.operations.remove(&id);
        if let Some(context) = context {
            if let Some(mut entry) = self.contexts.get_mut(&context) {
                entry.operations.remove(&id);
            }
        }
    }

    pub(crate) fn cleanup_context(&self, context: ContextId) -> usize {
        let ids: Vec<OperationId> = match self.contexts.get_mut(&context) {
            Some(mut entry) => entry.operations.drain().collect(),
            None => return 0,
        };
        self.abort_operations(ids, "context cleaned up")
    }

    pub(crate) fn release_context(&self, context: ContextId) -> usize {
        let (name, ids): (String, Vec<OperationId>) = match self.contexts.remove(&context) {
            Some((_, entry)) => (entry.name, entry.operations.into_iter().collect()),
            None => return 0,
        };
        let cancelled = self.abort_operations(ids, "context released");
        debug!(context = %name, cancelled = cancelled, "Timeout context released");
        cancelled
    }

    fn abort_operations(&self, ids: Vec<OperationId>, reason: &str) -> usize {
        let mut cancelled = 0;
        for id in ids {
            // Clone out of the map first; aborting removes the entry
            let operation = self
                .operations
                .get(&id)
                .map(|entry| Arc::clone(entry.value()));
            if let Some(operation) = operation {
                operation.abort_with(reason);
                cancelled += 1;
            }
        }
        cancelled
    }

    fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<Arc<dyn TrackedOperation>> = self
            .operations
            .iter()
            .filter(|entry| entry.value().is_stale(now, self.config.stale_grace_period))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for operation in &stale {
            let info = operation.info();
            warn!(
                operation_id = %info.id,
                operation = %info.name,
                age_ms = info.age.as_millis() as u64,
                "Aborting stale timeout operation"
            );
            operation.abort_with("stale operation swept");
        }
        stale.len()
    }

    fn stop_sweeper(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// Shared registry of timeout operations
#[derive(Clone)]
pub struct TimeoutManager {
    inner: Arc<ManagerInner>,
}

impl TimeoutManager {
    pub fn new(config: TimeoutManagerConfig) -> Self {
        Self::with_event_sink(config, crate::events::default_sink())
    }

    pub fn with_event_sink(config: TimeoutManagerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                operations: DashMap::new(),
                contexts: DashMap::new(),
                counters: Arc::new(TimeoutCounters::default()),
                events,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &TimeoutManagerConfig {
        &self.inner.config
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.config.default_timeout
    }

    /// Start tracking a new operation that is rejected with a `Timeout` error
    /// after `timeout` unless it is resolved, aborted or cleaned up first.
    ///
    /// Must be called from within a tokio runtime; the deadline is a spawned timer.
    pub fn create_timeout<T: Send + 'static>(
        &self,
        timeout: Duration,
        mut options: TimeoutOptions,
    ) -> TimeoutHandle<T> {
        if let Some(context) = options.context {
            if !self.inner.contexts.contains_key(&context) {
                warn!(
                    operation = %options.name,
                    context = %context,
                    "Timeout context already released; tracking operation globally only"
                );
                options.context = None;
            }
        }

        let (sender, receiver) = oneshot::channel();
        let name = options.name.clone();
        let state = Arc::new(OperationState::new(
            timeout,
            options,
            sender,
            Arc::clone(&self.inner.counters),
            Arc::clone(&self.inner.events),
            Arc::downgrade(&self.inner),
        ));
        let id = state.id();

        self.inner.counters.record_created();
        self.inner.track(
            Arc::clone(&state) as Arc<dyn TrackedOperation>,
            id,
            state.context(),
        );

        let timer_state = Arc::clone(&state);
        let deadline = Instant::now() + timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            timer_state.fire_timeout();
        });
        state.set_timer(timer.abort_handle());

        debug!(
            operation_id = %id,
            operation = %name,
            timeout_ms = timeout.as_millis() as u64,
            "Timeout operation created"
        );

        TimeoutHandle::new(TimeoutFuture::new(receiver, name), TimeoutController::new(state))
    }

    /// Race `operation` against a fresh timeout operation.
    ///
    /// The timeout operation is cleaned up however the race ends, including
    /// when the returned future is dropped.
    pub async fn wrap_with_timeout<F>(
        &self,
        operation: F,
        timeout: Duration,
        options: TimeoutOptions,
    ) -> ResilienceResult<F::Output>
    where
        F: Future,
    {
        let name = options.name.clone();
        let (deadline, controller) = self.create_timeout::<()>(timeout, options).into_parts();
        let _guard = CleanupGuard(controller.clone());

        tokio::pin!(operation);
        tokio::select! {
            biased;
            output = &mut operation => {
                controller.resolve(());
                Ok(output)
            }
            settled = deadline => match settled {
                Err(err) => Err(err),
                Ok(()) => Err(ResilienceError::aborted(name, "deadline resolved without a result")),
            },
        }
    }

    /// Open a context for grouping operations
    pub fn create_context(&self, name: impl Into<String>) -> TimeoutContext {
        let context = TimeoutContext::new(name.into(), Arc::downgrade(&self.inner));
        self.inner.contexts.insert(
            context.id(),
            ContextEntry {
                name: context.name().to_string(),
                operations: HashSet::new(),
            },
        );
        context
    }

    /// Abort every operation associated with `context`; returns how many were cancelled
    pub fn cleanup_context(&self, context: &TimeoutContext) -> usize {
        self.inner.cleanup_context(context.id())
    }

    /// Abort the context's operations and drop the context relation
    pub fn release_context(&self, context: TimeoutContext) -> usize {
        context.release()
    }

    pub fn get_stats(&self) -> TimeoutStats {
        let (total_created, completed, timed_out, aborted) = self.inner.counters.snapshot();
        let pending_timers = self
            .inner
            .operations
            .iter()
            .filter(|entry| entry.value().has_pending_timer())
            .count();
        let context_links = self
            .inner
            .contexts
            .iter()
            .map(|entry| entry.value().operations.len())
            .sum();
        let active_operations = self.inner.operations.len();
        let active_contexts = self.inner.contexts.len();

        TimeoutStats {
            active_operations,
            total_created,
            completed,
            timed_out,
            aborted,
            active_contexts,
            memory: MemoryFootprint {
                tracked_operations: active_operations,
                pending_timers,
                context_entries: active_contexts,
                context_links,
            },
        }
    }

    /// Snapshot of every tracked operation, oldest first
    pub fn active_operations(&self) -> Vec<OperationInfo> {
        let mut operations: Vec<OperationInfo> = self
            .inner
            .operations
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        operations.sort_by(|a, b| b.age.cmp(&a.age));
        operations
    }

    /// Abort operations older than their timeout plus the grace period
    pub fn sweep_stale_operations(&self) -> usize {
        self.inner.sweep_stale()
    }

    /// Start the periodic stale-operation sweep. Returns false when it is
    /// disabled by configuration or already running.
    pub fn start_periodic_cleanup(&self) -> bool {
        let Some(interval) = self.inner.config.cleanup_interval else {
            return false;
        };

        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.sweep_stale();
                let active = inner.operations.len();
                if removed > 0 {
                    publish_isolated(
                        inner.events.as_ref(),
                        ResilienceEvent::PeriodicCleanup { removed, active },
                    );
                } else {
                    debug!(active = active, "Periodic timeout cleanup found nothing stale");
                }
            }
        }));

        info!(
            interval_ms = interval.as_millis() as u64,
            "Started periodic timeout cleanup"
        );
        true
    }

    pub fn stop_periodic_cleanup(&self) {
        self.inner.stop_sweeper();
    }

    /// Stop the sweep and abort every tracked operation
    pub fn shutdown(&self) -> usize {
        self.inner.stop_sweeper();

        let ids: Vec<OperationId> = self
            .inner
            .operations
            .iter()
            .map(|entry| *entry.key())
            .collect();
        let cancelled = self
            .inner
            .abort_operations(ids, "timeout manager shutting down");
        self.inner.contexts.clear();

        info!(cancelled = cancelled, "Timeout manager shut down");
        cancelled
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new(TimeoutManagerConfig::default())
    }
}

impl fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("config", &self.inner.config)
            .field("active_operations", &self.inner.operations.len())
            .field("active_contexts", &self.inner.contexts.len())
            .finish()
    }
}

struct CleanupGuard(TimeoutController<()>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.0.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::BroadcastEventSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> TimeoutManager {
        TimeoutManager::new(TimeoutManagerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_operation_times_out() {
        let manager = manager();
        let started = Instant::now();

        let handle = manager.create_timeout::<u32>(
            Duration::from_millis(100),
            TimeoutOptions::named("fetch"),
        );
        let err = handle.await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(110));

        let stats = manager.get_stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.active_operations, 0);
        assert!(stats.memory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_settles_and_cleans_up() {
        let manager = manager();
        let handle = manager.create_timeout::<&str>(Duration::from_secs(5), TimeoutOptions::named("op"));

        assert!(handle.resolve("done"));
        assert!(!handle.resolve("again"));
        assert_eq!(handle.await.unwrap(), "done");

        let stats = manager.get_stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_and_cleanup_are_idempotent() {
        let manager = manager();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleanups);

        let handle = manager.create_timeout::<()>(
            Duration::from_secs(5),
            TimeoutOptions::named("upload").on_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let controller = handle.controller();

        assert!(controller.abort("user cancelled"));
        assert!(!controller.abort("again"));
        assert!(!controller.cleanup());
        assert!(controller.is_cleaned_up());

        match handle.await.unwrap_err() {
            ResilienceError::Aborted { reason, .. } => assert_eq!(reason, "user cancelled"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_stats().aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callbacks_are_isolated() {
        let sink = BroadcastEventSink::new(16);
        let mut events = sink.subscribe();
        let manager = TimeoutManager::with_event_sink(TimeoutManagerConfig::default(), Arc::new(sink));

        let handle = manager.create_timeout::<()>(
            Duration::from_millis(10),
            TimeoutOptions::named("flaky")
                .on_timeout(|_| panic!("on_timeout exploded"))
                .on_cleanup(|| panic!("on_cleanup exploded")),
        );

        assert!(handle.await.unwrap_err().is_timeout());
        assert_eq!(manager.get_stats().active_operations, 0);

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.event.name(), "callback.failed");
        assert_eq!(second.event.name(), "callback.failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_with_timeout_rejects_slow_operation() {
        let manager = manager();
        let baseline = manager.get_stats().active_operations;
        let started = Instant::now();

        let result = manager
            .wrap_with_timeout(
                std::future::pending::<()>(),
                Duration::from_millis(100),
                TimeoutOptions::named("never"),
            )
            .await;

        assert!(result.unwrap_err().is_timeout());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(110));
        assert_eq!(manager.get_stats().active_operations, baseline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_with_timeout_passes_through_fast_operation() {
        let manager = manager();

        let result = manager
            .wrap_with_timeout(
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    42
                },
                Duration::from_millis(100),
                TimeoutOptions::named("fast"),
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        let stats = manager.get_stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.timed_out, 0);
        assert_eq!(stats.active_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_wrapper_cleans_up() {
        let manager = manager();
        {
            let wrapped = manager.wrap_with_timeout(
                std::future::pending::<()>(),
                Duration::from_secs(10),
                TimeoutOptions::named("dropped"),
            );
            let _ = tokio::time::timeout(Duration::from_millis(5), wrapped).await;
        }
        assert_eq!(manager.get_stats().active_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_cleanup_only_touches_its_operations() {
        let manager = manager();
        let context = manager.create_context("worker-1");

        let scoped: Vec<_> = (0..3)
            .map(|i| {
                manager.create_timeout::<()>(
                    Duration::from_secs(60),
                    TimeoutOptions::named(format!("scoped-{i}")).in_context(&context),
                )
            })
            .collect();
        let unrelated =
            manager.create_timeout::<()>(Duration::from_secs(60), TimeoutOptions::named("other"));

        assert_eq!(manager.get_stats().memory.context_links, 3);
        assert_eq!(manager.cleanup_context(&context), 3);
        assert_eq!(manager.get_stats().active_operations, 1);
        assert_eq!(manager.get_stats().active_contexts, 1);

        for handle in scoped {
            assert_eq!(handle.await.unwrap_err().kind(), ErrorKind::Aborted);
        }
        assert!(unrelated.cleanup());
        assert_eq!(manager.release_context(context), 0);
        assert!(manager.get_stats().memory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_context_releases_it() {
        let manager = manager();
        let handle = {
            let context = manager.create_context("short-lived");
            manager.create_timeout::<()>(
                Duration::from_secs(60),
                TimeoutOptions::named("scoped").in_context(&context),
            )
        };

        assert_eq!(handle.await.unwrap_err().kind(), ErrorKind::Aborted);
        let stats = manager.get_stats();
        assert_eq!(stats.active_contexts, 0);
        assert_eq!(stats.active_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_aborts_operations_past_grace_period() {
        let manager = TimeoutManager::new(TimeoutManagerConfig {
            stale_grace_period: Duration::from_millis(50),
            ..Default::default()
        });
        let handle =
            manager.create_timeout::<()>(Duration::from_millis(100), TimeoutOptions::named("stuck"));
        assert_eq!(manager.sweep_stale_operations(), 0);

        // Simulate a timer lost with its runtime
        let operation = manager
            .inner
            .operations
            .get(&handle.id())
            .map(|entry| Arc::clone(entry.value()))
            .unwrap();
        operation.disarm_timer();

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(manager.sweep_stale_operations(), 1);

        match handle.await.unwrap_err() {
            ResilienceError::Aborted { reason, .. } => assert_eq!(reason, "stale operation swept"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.get_stats().active_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_everything() {
        let manager = manager();
        let context = manager.create_context("ctx");
        let a = manager.create_timeout::<()>(Duration::from_secs(5), TimeoutOptions::named("a"));
        let b = manager.create_timeout::<()>(
            Duration::from_secs(5),
            TimeoutOptions::named("b").in_context(&context),
        );

        assert!(manager.start_periodic_cleanup());
        assert!(!manager.start_periodic_cleanup());
        assert_eq!(manager.shutdown(), 2);

        assert!(a.await.is_err());
        assert!(b.await.is_err());
        let stats = manager.get_stats();
        assert_eq!(stats.aborted, 2);
        assert!(stats.memory.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(TimeoutManagerConfig::default().validate().is_ok());
        let config = TimeoutManagerConfig {
            cleanup_interval: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
