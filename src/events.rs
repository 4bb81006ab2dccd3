//! # Resilience Events
//!
//! Fire-and-forget notifications for the logging/observability collaborator.
//! Sinks are invoked synchronously at the point of the state change; a panicking
//! sink is caught and logged so it can never disturb the primitive that emitted
//! the event.

use crate::circuit_breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Notification emitted by the resilience primitives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    BreakerOpened {
        component: String,
        failures: u64,
        volume: u64,
    },
    BreakerHalfOpened {
        component: String,
    },
    BreakerClosed {
        component: String,
    },
    BreakerRemoved {
        component: String,
        last_state: CircuitState,
    },
    CallbackFailed {
        operation: String,
        callback: String,
        message: String,
    },
    PeriodicCleanup {
        removed: usize,
        active: usize,
    },
    BackpressureActivated {
        memory_mb: u64,
        threshold_mb: u64,
    },
    BackpressureDeactivated {
        memory_mb: u64,
    },
}

impl ResilienceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::BreakerOpened { .. } => "breaker.opened",
            ResilienceEvent::BreakerHalfOpened { .. } => "breaker.half_opened",
            ResilienceEvent::BreakerClosed { .. } => "breaker.closed",
            ResilienceEvent::BreakerRemoved { .. } => "breaker.removed",
            ResilienceEvent::CallbackFailed { .. } => "callback.failed",
            ResilienceEvent::PeriodicCleanup { .. } => "timeouts.periodic_cleanup",
            ResilienceEvent::BackpressureActivated { .. } => "stream.backpressure_activated",
            ResilienceEvent::BackpressureDeactivated { .. } => "stream.backpressure_deactivated",
        }
    }
}

/// Receiver of resilience notifications
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn publish(&self, event: &ResilienceEvent);
}

/// Deliver an event, swallowing any panic raised by the sink
pub fn publish_isolated(sink: &dyn EventSink, event: ResilienceEvent) {
    if catch_unwind(AssertUnwindSafe(|| sink.publish(&event))).is_err() {
        error!(event = event.name(), "Event sink panicked while publishing");
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a caller-supplied callback, logging and reporting a panic instead of unwinding
pub(crate) fn run_callback_isolated<F: FnOnce()>(
    sink: &dyn EventSink,
    operation: &str,
    callback: &str,
    f: F,
) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                operation = operation,
                callback = callback,
                message = %message,
                "Callback panicked; continuing"
            );
            publish_isolated(
                sink,
                ResilienceEvent::CallbackFailed {
                    operation: operation.to_string(),
                    callback: callback.to_string(),
                    message,
                },
            );
            false
        }
    }
}

/// Default sink that writes every event to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::BreakerOpened {
                component,
                failures,
                volume,
            } => error!(
                component = %component,
                failures = failures,
                volume = volume,
                "Circuit breaker opened (failing fast)"
            ),
            ResilienceEvent::BreakerHalfOpened { component } => info!(
                component = %component,
                "Circuit breaker half-open (testing recovery)"
            ),
            ResilienceEvent::BreakerClosed { component } => {
                info!(component = %component, "Circuit breaker closed (recovered)")
            }
            ResilienceEvent::BreakerRemoved {
                component,
                last_state,
            } => info!(component = %component, last_state = ?last_state, "Circuit breaker removed"),
            ResilienceEvent::CallbackFailed {
                operation,
                callback,
                message,
            } => warn!(
                operation = %operation,
                callback = %callback,
                message = %message,
                "Callback failed"
            ),
            ResilienceEvent::PeriodicCleanup { removed, active } => info!(
                removed = removed,
                active = active,
                "Periodic timeout cleanup completed"
            ),
            ResilienceEvent::BackpressureActivated {
                memory_mb,
                threshold_mb,
            } => warn!(
                memory_mb = memory_mb,
                threshold_mb = threshold_mb,
                "Backpressure activated"
            ),
            ResilienceEvent::BackpressureDeactivated { memory_mb } => {
                info!(memory_mb = memory_mb, "Backpressure deactivated")
            }
        }
    }
}

/// Event that has been published through a [`BroadcastEventSink`]
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: ResilienceEvent,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// Sink fanning events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<PublishedEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: &ResilienceEvent) {
        // No subscribers is fine; events are fire-and-forget
        let _ = self.sender.send(PublishedEvent {
            event: event.clone(),
            published_at: chrono::Utc::now(),
        });
    }
}

pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingEventSink)
}
