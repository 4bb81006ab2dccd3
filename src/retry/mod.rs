//! # Retry
//!
//! Delay calculation, retryable-error classification and the retry executor.
//!
//! ```rust,no_run
//! use tasker_resilience::retry::{with_retry, RetryConfig, RetryPolicy};
//!
//! # async fn example() {
//! let policy: RetryPolicy<String> = RetryPolicy::new(RetryConfig::for_network());
//! let outcome = with_retry(|attempt| async move {
//!     if attempt < 2 { Err("503 service unavailable".to_string()) } else { Ok(attempt) }
//! }, &policy).await;
//! assert!(outcome.is_success());
//! # }
//! ```

pub mod backoff;
pub mod classifier;
pub mod executor;

pub use backoff::{calculate_delay, calculate_delay_with_sample, BackoffStrategy, JITTER_RATIO};
pub use classifier::{classify_error_message, is_retryable_error, ErrorCategory};
pub use executor::{with_retry, RetryConfig, RetryOutcome, RetryPolicy};
