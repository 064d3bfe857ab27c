//! Error types for the bulk check dispatcher.

use thiserror::Error;

use crate::validate::IdentifierKind;

/// Result type alias using the bulkcheck error type.
pub type Result<T> = std::result::Result<T, BulkCheckError>;

/// Main error type for the dispatcher.
///
/// Per-item failures never surface through this type once a session is running;
/// they are recorded on the item's slot as a [`FailureReason`](crate::domain::FailureReason).
#[derive(Error, Debug)]
pub enum BulkCheckError {
    /// No validated tokens were supplied
    #[error("No valid tokens available")]
    EmptyTokenPool,

    /// The device reported itself offline before the session could start
    #[error("Device is offline, check cannot start")]
    Offline,

    /// A session for the same check kind is still running
    #[error("A {0} check is already running")]
    SessionActive(IdentifierKind),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// A single attempt exceeded its deadline
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Transport-level failure (refused, reset, DNS)
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Invalid input or configuration
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BulkCheckError {
    /// True for the caller-initiated abort, which is never retried.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BulkCheckError::Cancelled)
    }

    /// Whether a fetch attempt that failed with this error may be attempted again.
    pub fn is_retriable(&self) -> bool {
        match self {
            BulkCheckError::Timeout(_) | BulkCheckError::Connection(_) => true,
            BulkCheckError::HttpClient(e) => !e.is_builder(),
            BulkCheckError::Other(_) => true,
            _ => false,
        }
    }

    /// Split transport errors into timeout and connection failures.
    ///
    /// reqwest reports both through one error type; the dispatcher wants to tell
    /// the operator which one happened.
    pub fn classify(self, timeout_ms: u64) -> Self {
        match self {
            BulkCheckError::HttpClient(e) if e.is_timeout() => BulkCheckError::Timeout(timeout_ms),
            BulkCheckError::HttpClient(e) if e.is_connect() => {
                BulkCheckError::Connection(e.to_string())
            }
            other => other,
        }
    }
}
