//! # Retryable Error Classification
//!
//! Default classifier consulted by the retry executor when the caller does not
//! supply a `should_retry` predicate. Classification works on the rendered error
//! message so it applies to any `Display` error, including HTTP client errors that
//! only expose their status in text.

use serde::{Deserialize, Serialize};

/// Primary error categories for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection-level failure - retry with backoff
    Network,
    /// Deadline exceeded - retry, possibly with a longer deadline
    Timeout,
    /// Throttled by the remote side - retry with backoff
    RateLimit,
    /// Remote 5xx - the dependency may recover
    ServerError,
    /// Remote 4xx or validation failure - will never succeed if retried
    ClientError,
    /// Nothing recognizable
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
                | ErrorCategory::ServerError
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Timeout => write!(f, "Timeout"),
            ErrorCategory::RateLimit => write!(f, "Rate Limit"),
            ErrorCategory::ServerError => write!(f, "Server Error"),
            ErrorCategory::ClientError => write!(f, "Client Error"),
            ErrorCategory::Unknown => write!(f, "Unknown"),
        }
    }
}

const NETWORK_PATTERNS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "enotfound",
    "epipe",
    "ehostunreach",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "network",
    "socket hang up",
    "dns",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];

const RATE_LIMIT_PATTERNS: &[&str] = &["429", "rate limit", "too many requests", "throttl"];

const SERVER_PATTERNS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "temporarily unavailable",
];

const CLIENT_PATTERNS: &[&str] = &[
    "400",
    "401",
    "403",
    "404",
    "422",
    "bad request",
    "unauthorized",
    "forbidden",
    "not found",
    "invalid",
];

/// Classify an error by its message.
///
/// Retryable signatures win over client-error signatures so that
/// "upstream returned 503 for /invalid" is still retried.
pub fn classify_error_message(message: &str) -> ErrorCategory {
    let message = message.to_lowercase();
    let matches_any = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

    if matches_any(TIMEOUT_PATTERNS) {
        ErrorCategory::Timeout
    } else if matches_any(RATE_LIMIT_PATTERNS) {
        ErrorCategory::RateLimit
    } else if matches_any(SERVER_PATTERNS) {
        ErrorCategory::ServerError
    } else if matches_any(NETWORK_PATTERNS) {
        ErrorCategory::Network
    } else if matches_any(CLIENT_PATTERNS) {
        ErrorCategory::ClientError
    } else {
        ErrorCategory::Unknown
    }
}

/// Default retryability predicate used by [`crate::retry::with_retry`]
pub fn is_retryable_error<E: std::fmt::Display + ?Sized>(error: &E) -> bool {
    classify_error_message(&error.to_string()).is_retryable()
}
