//! # Circuit Breakers
//!
//! Sheds load from a failing dependency. Breakers are independent of the retry
//! executor; compose the two explicitly when both are wanted.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_resilience::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
//!
//! # async fn example() {
//! let registry = CircuitBreakerRegistry::new();
//! let outcome = registry
//!     .with_circuit_breaker(
//!         "workflow_service",
//!         || async { Ok::<_, std::io::Error>("submitted") },
//!         Some(CircuitBreakerConfig::for_external_api()),
//!     )
//!     .await;
//!
//! if let Some(err) = outcome.error() {
//!     if err.is_circuit_open() {
//!         // fall back immediately
//!     }
//! }
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod metrics;
pub mod registry;

pub use breaker::{CircuitBreaker, CircuitBreakerError, CircuitState, PatternResult};
pub use config::CircuitBreakerConfig;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use registry::CircuitBreakerRegistry;
