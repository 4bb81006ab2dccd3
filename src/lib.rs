#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Resilience
//!
//! Resilience and flow-control primitives for executing unreliable,
//! latency-variable operations under load.
//!
//! ## Overview
//!
//! Five composable primitives share one error taxonomy, one event sink and
//! one injectable timeout registry:
//!
//! - [`batch`] - request batching with size, time and minimum-size triggers
//! - [`retry`] - retry executor with fixed, linear and exponential backoff
//! - [`circuit_breaker`] - per-component breakers that shed load from a failing dependency
//! - [`timeout`] - cancellable timeouts with context-scoped bulk cancellation
//! - [`stream`] - bounded-concurrency stream processing with memory backpressure
//!
//! ## Module Organization
//!
//! - [`core`] - bootstrap from configuration, wiring shared collaborators
//! - [`config`] - YAML configuration with environment overrides
//! - [`error`] - [`ResilienceError`] and [`ErrorKind`]
//! - [`events`] - fire-and-forget notifications for observability
//! - [`logging`] - structured console and JSON file logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tasker_resilience::config::ResilienceConfig;
//! use tasker_resilience::ResilienceCore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let core = ResilienceCore::from_config(&ResilienceConfig::default())?;
//!
//! let breaker = core.circuit_breaker("payments");
//! let charged = breaker
//!     .call(|| async { Ok::<_, std::io::Error>("charged") })
//!     .await?;
//! println!("{charged}");
//!
//! core.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! Every primitive runs on tokio. Shared state sits behind short synchronous
//! locks that are never held across an `.await`; timers use `tokio::time`
//! so tests can run under paused time.

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod logging;
pub mod retry;
pub mod stream;
pub mod timeout;

pub use batch::{BatchConfig, BatchManager, BatchProcessor, BatchRegistry, ErrorHandlingStrategy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitState,
};
pub use config::{ConfigManager, ResilienceConfig};
pub use core::ResilienceCore;
pub use error::{ErrorKind, ResilienceError, ResilienceResult};
pub use events::{BroadcastEventSink, EventSink, ResilienceEvent, TracingEventSink};
pub use retry::{with_retry, BackoffStrategy, RetryConfig, RetryOutcome, RetryPolicy};
pub use stream::{CancellationSignal, ResultStream, StreamConfig, StreamProcessor};
pub use timeout::{TimeoutContext, TimeoutManager, TimeoutOptions};
