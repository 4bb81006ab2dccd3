//! # Timeout Operations
//!
//! One tracked, deadline-bounded operation. The manager owns the registry
//! entry, a spawned timer owns the deadline and the caller holds a
//! [`TimeoutHandle`] made of a [`TimeoutFuture`] (the result side) and a
//! [`TimeoutController`] (the control side). Every settlement path ends in
//! `cleanup`, which is idempotent.

use super::context::{ContextId, TimeoutContext};
use super::manager::ManagerInner;
use super::stats::TimeoutCounters;
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::{run_callback_isolated, EventSink};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub type TimeoutCallback = Box<dyn FnOnce(&OperationInfo) + Send + 'static>;
pub type CleanupCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How an operation settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    TimedOut,
    Aborted,
}

/// Diagnostic snapshot of a tracked operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationInfo {
    pub id: OperationId,
    pub name: String,
    pub context: Option<ContextId>,
    pub timeout: Duration,
    pub age: Duration,
    pub settled: bool,
}

/// Name, context and callbacks for a new timeout operation
pub struct TimeoutOptions {
    pub(crate) name: String,
    pub(crate) context: Option<ContextId>,
    pub(crate) on_timeout: Option<TimeoutCallback>,
    pub(crate) on_cleanup: Option<CleanupCallback>,
}

impl TimeoutOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Associate the operation with a context for bulk cancellation
    pub fn in_context(mut self, context: &TimeoutContext) -> Self {
        self.context = Some(context.id());
        self
    }

    /// Invoked once, after the operation has been rejected with a timeout
    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&OperationInfo) + Send + 'static,
    {
        self.on_timeout = Some(Box::new(callback));
        self
    }

    /// Invoked exactly once when the operation is cleaned up, however it settled
    pub fn on_cleanup<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cleanup = Some(Box::new(callback));
        self
    }
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            name: "anonymous".to_string(),
            context: None,
            on_timeout: None,
            on_cleanup: None,
        }
    }
}

impl fmt::Debug for TimeoutOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutOptions")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_cleanup", &self.on_cleanup.is_some())
            .finish()
    }
}

/// Type-erased view the manager keeps in its registries
pub(crate) trait TrackedOperation: Send + Sync {
    fn info(&self) -> OperationInfo;
    fn is_stale(&self, now: Instant, grace_period: Duration) -> bool;
    fn has_pending_timer(&self) -> bool;
    fn abort_with(&self, reason: &str) -> bool;
    #[cfg(test)]
    fn disarm_timer(&self);
}

pub(crate) struct OperationState<T> {
    id: OperationId,
    name: String,
    context: Option<ContextId>,
    timeout: Duration,
    created_at: Instant,
    sender: Mutex<Option<oneshot::Sender<ResilienceResult<T>>>>,
    cleaned_up: AtomicBool,
    timer: Mutex<Option<AbortHandle>>,
    on_timeout: Mutex<Option<TimeoutCallback>>,
    on_cleanup: Mutex<Option<CleanupCallback>>,
    counters: Arc<TimeoutCounters>,
    events: Arc<dyn EventSink>,
    manager: Weak<ManagerInner>,
}

impl<T: Send + 'static> OperationState<T> {
    pub(crate) fn new(
        timeout: Duration,
        options: TimeoutOptions,
        sender: oneshot::Sender<ResilienceResult<T>>,
        counters: Arc<TimeoutCounters>,
        events: Arc<dyn EventSink>,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            name: options.name,
            context: options.context,
            timeout,
            created_at: Instant::now(),
            sender: Mutex::new(Some(sender)),
            cleaned_up: AtomicBool::new(false),
            timer: Mutex::new(None),
            on_timeout: Mutex::new(options.on_timeout),
            on_cleanup: Mutex::new(options.on_cleanup),
            counters,
            events,
            manager,
        }
    }

    pub(crate) fn id(&self) -> OperationId {
        self.id
    }

    pub(crate) fn context(&self) -> Option<ContextId> {
        self.context
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_timer(&self, timer: AbortHandle) {
        *self.timer.lock() = Some(timer);
        // Cleanup may have raced ahead of the timer being recorded
        if self.cleaned_up.load(Ordering::Acquire) {
            if let Some(timer) = self.timer.lock().take() {
                timer.abort();
            }
        }
    }

    fn settle(&self, result: ResilienceResult<T>, outcome: OperationOutcome) -> bool {
        let sender = self.sender.lock().take();
        match sender {
            Some(sender) => {
                self.counters.record(outcome);
                // The caller may have dropped the future; the outcome still counts
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    fn is_settled(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub(crate) fn fire_timeout(&self) {
        self.timer.lock().take();

        if !self.settle(
            Err(ResilienceError::timeout(&self.name, self.timeout)),
            OperationOutcome::TimedOut,
        ) {
            return;
        }

        warn!(
            operation_id = %self.id,
            operation = %self.name,
            timeout_ms = self.timeout.as_millis() as u64,
            "Operation timed out"
        );

        let callback = self.on_timeout.lock().take();
        if let Some(callback) = callback {
            let info = self.info();
            run_callback_isolated(self.events.as_ref(), &self.name, "on_timeout", move || {
                callback(&info)
            });
        }

        self.cleanup();
    }

    pub(crate) fn resolve(&self, value: T) -> bool {
        let resolved = self.settle(Ok(value), OperationOutcome::Completed);
        self.cleanup();
        resolved
    }

    pub(crate) fn abort(&self, reason: &str) -> bool {
        let aborted = self.settle(
            Err(ResilienceError::aborted(&self.name, reason)),
            OperationOutcome::Aborted,
        );
        if aborted {
            debug!(operation_id = %self.id, operation = %self.name, reason = reason, "Operation aborted");
        }
        self.cleanup();
        aborted
    }

    pub(crate) fn cleanup(&self) -> bool {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.settle(
            Err(ResilienceError::aborted(
                &self.name,
                "cleaned up before settling",
            )),
            OperationOutcome::Aborted,
        );

        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.untrack(self.id, self.context);
        }

        let callback = self.on_cleanup.lock().take();
        if let Some(callback) = callback {
            run_callback_isolated(self.events.as_ref(), &self.name, "on_cleanup", callback);
        }

        debug!(operation_id = %self.id, operation = %self.name, "Operation cleaned up");
        true
    }
}

impl<T: Send + 'static> TrackedOperation for OperationState<T> {
    fn info(&self) -> OperationInfo {
        OperationInfo {
            id: self.id,
            name: self.name.clone(),
            context: self.context,
            timeout: self.timeout,
            age: self.created_at.elapsed(),
            settled: self.is_settled(),
        }
    }

    fn is_stale(&self, now: Instant, grace_period: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > self.timeout + grace_period
    }

    fn has_pending_timer(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    fn abort_with(&self, reason: &str) -> bool {
        self.abort(reason)
    }

    #[cfg(test)]
    fn disarm_timer(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

/// Control half of a timeout operation; clones share the same operation
pub struct TimeoutController<T> {
    state: Arc<OperationState<T>>,
}

impl<T: Send + 'static> TimeoutController<T> {
    pub(crate) fn new(state: Arc<OperationState<T>>) -> Self {
        Self { state }
    }

    pub fn id(&self) -> OperationId {
        self.state.id()
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Settle successfully with `value`, then clean up. False if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.state.resolve(value)
    }

    /// Reject with an `Aborted` error, then clean up. False if already settled.
    pub fn abort(&self, reason: &str) -> bool {
        self.state.abort(reason)
    }

    /// Remove the operation from every registry. Only the first call has effect.
    pub fn cleanup(&self) -> bool {
        self.state.cleanup()
    }

    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.state.cleaned_up.load(Ordering::Acquire)
    }
}

impl<T> Clone for TimeoutController<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for TimeoutController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutController")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .finish()
    }
}

/// Resolves exactly once with the operation's outcome
#[derive(Debug)]
pub struct TimeoutFuture<T> {
    receiver: oneshot::Receiver<ResilienceResult<T>>,
    name: String,
}

impl<T> TimeoutFuture<T> {
    pub(crate) fn new(receiver: oneshot::Receiver<ResilienceResult<T>>, name: String) -> Self {
        Self { receiver, name }
    }
}

impl<T> Future for TimeoutFuture<T> {
    type Output = ResilienceResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ResilienceError::aborted(
                    &this.name,
                    "operation dropped before settling",
                ))
            })
        })
    }
}

/// Returned by [`TimeoutManager::create_timeout`](super::TimeoutManager::create_timeout).
///
/// Awaiting the handle yields the outcome; the controller methods are
/// available directly on the handle as well.
#[derive(Debug)]
pub struct TimeoutHandle<T> {
    future: TimeoutFuture<T>,
    controller: TimeoutController<T>,
}

impl<T: Send + 'static> TimeoutHandle<T> {
    pub(crate) fn new(future: TimeoutFuture<T>, controller: TimeoutController<T>) -> Self {
        Self { future, controller }
    }

    pub fn id(&self) -> OperationId {
        self.controller.id()
    }

    pub fn controller(&self) -> TimeoutController<T> {
        self.controller.clone()
    }

    pub fn resolve(&self, value: T) -> bool {
        self.controller.resolve(value)
    }

    pub fn abort(&self, reason: &str) -> bool {
        self.controller.abort(reason)
    }

    pub fn cleanup(&self) -> bool {
        self.controller.cleanup()
    }

    pub fn into_parts(self) -> (TimeoutFuture<T>, TimeoutController<T>) {
        (self.future, self.controller)
    }
}

impl<T> Future for TimeoutHandle<T> {
    type Output = ResilienceResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().future).poll(cx)
    }
}
