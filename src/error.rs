//! # Resilience Error Taxonomy
//!
//! Every primitive in this crate reports failure through [`ResilienceError`]. Timeouts,
//! open circuits and batch rejections are expected, recoverable outcomes and are kept
//! distinguishable from the caller's own errors, which travel through unchanged as
//! [`ResilienceError::Upstream`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`ResilienceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    Aborted,
    CircuitOpen,
    BatchCleared,
    ShuttingDown,
    ResultCountMismatch,
    StreamAborted,
    Configuration,
    Upstream,
}

#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// Operation exceeded its deadline
    #[error("Operation '{operation}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// Operation was cancelled externally before it settled
    #[error("Operation '{operation}' aborted: {reason}")]
    Aborted { operation: String, reason: String },

    /// Call rejected without execution because the breaker is open
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Item discarded by an explicit `clear()`
    #[error("Batch '{batch}' was cleared before the item was processed")]
    BatchCleared { batch: String },

    /// Item rejected because the batch manager is draining
    #[error("Batch manager '{batch}' is shutting down")]
    ShuttingDown { batch: String },

    /// Processor returned a different number of results than it was given items
    #[error("Batch processor returned {actual} results for {expected} items")]
    ResultCountMismatch { expected: usize, actual: usize },

    /// Stream stopped before the item could be delivered
    #[error("Stream aborted: {0}")]
    StreamAborted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The wrapped operation's own error, passed through unchanged
    #[error(transparent)]
    Upstream(Arc<anyhow::Error>),
}

impl ResilienceError {
    /// Wrap a caller error so it can be shared across every item of a failed group
    pub fn upstream(error: impl Into<anyhow::Error>) -> Self {
        ResilienceError::Upstream(Arc::new(error.into()))
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        ResilienceError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn aborted(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        ResilienceError::Aborted {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::Timeout { .. } => ErrorKind::Timeout,
            ResilienceError::Aborted { .. } => ErrorKind::Aborted,
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::BatchCleared { .. } => ErrorKind::BatchCleared,
            ResilienceError::ShuttingDown { .. } => ErrorKind::ShuttingDown,
            ResilienceError::ResultCountMismatch { .. } => ErrorKind::ResultCountMismatch,
            ResilienceError::StreamAborted(_) => ErrorKind::StreamAborted,
            ResilienceError::InvalidConfiguration(_) => ErrorKind::Configuration,
            ResilienceError::Upstream(_) => ErrorKind::Upstream,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind() == ErrorKind::CircuitOpen
    }

    /// Whether a caller may reasonably try the same operation again.
    ///
    /// Upstream errors defer to the message classifier in [`crate::retry::classifier`].
    pub fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::Timeout { .. } | ResilienceError::CircuitOpen { .. } => true,
            ResilienceError::Upstream(inner) => {
                crate::retry::classifier::classify_error_message(&inner.to_string())
                    .is_retryable()
            }
            _ => false,
        }
    }

    /// Borrow the caller's error when this is an upstream failure
    pub fn as_upstream(&self) -> Option<&anyhow::Error> {
        match self {
            ResilienceError::Upstream(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;
