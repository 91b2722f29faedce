//! Error types for the LinkStor coordinator

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Key absent in every tier
    #[error("Short code not found: {short}")]
    NotFound { short: String },

    /// Write-behind queue at capacity (backpressure, retryable by caller)
    #[error("Write queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Write-behind queue no longer accepts writes
    #[error("Write queue is closed")]
    QueueClosed,

    /// Durable tier could not be reached
    #[error("Durable tier unreachable: {0}")]
    DurableUnreachable(String),

    /// Fast tier could not be reached
    #[error("Fast tier unreachable: {0}")]
    FastTierUnreachable(String),

    /// A tier call exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Durable write gave up after the retry budget was spent
    #[error("Durable write for {short} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        short: String,
        attempts: u32,
        last_error: String,
    },

    /// No free short code found within the attempt budget
    #[error("Failed to allocate a short code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },

    /// Component was already stopped
    #[error("{0} already stopped")]
    AlreadyStopped(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient failures that a caller or the queue worker may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QueueFull { .. }
                | Error::Timeout { .. }
                | Error::DurableUnreachable(_)
                | Error::FastTierUnreachable(_)
        )
    }

    /// Shorthand for a not-found error.
    pub fn not_found(short: impl Into<String>) -> Self {
        Error::NotFound {
            short: short.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::QueueFull { capacity: 1 }.is_retryable());
        assert!(Error::DurableUnreachable("down".into()).is_retryable());
        assert!(Error::FastTierUnreachable("down".into()).is_retryable());
        assert!(Error::Timeout {
            operation: "durable.insert",
            after: Duration::from_secs(5)
        }
        .is_retryable());

        assert!(!Error::not_found("abc").is_retryable());
        assert!(!Error::QueueClosed.is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::not_found("abc1234").to_string(),
            "Short code not found: abc1234"
        );
        assert_eq!(
            Error::QueueFull { capacity: 200 }.to_string(),
            "Write queue is full (capacity 200)"
        );
        assert_eq!(
            Error::AlreadyStopped("ttl cache").to_string(),
            "ttl cache already stopped"
        );
    }
}
