//! Error types for the usher workspace.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the usher error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for admission and session handling.
///
/// Admission failures (`QueueFull`, `RateLimited`, `AdmissionTimeout`,
/// `AdmissionCancelled`) are returned synchronously to the caller and are
/// expected under load. `SessionIsolation` signals a programming error and
/// must never occur in correct operation.
#[derive(Error, Debug)]
pub enum Error {
    /// Admission queue at capacity; the caller should retry later.
    #[error("admission queue full ({queued} waiting)")]
    QueueFull {
        /// Queue depth observed at rejection time.
        queued: usize,
    },

    /// Rolling-window rate cap exceeded.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// Time until the oldest window timestamp expires.
        retry_after: Duration,
    },

    /// Queued longer than the configured admission timeout.
    #[error("timed out waiting for admission")]
    AdmissionTimeout,

    /// A queued request was cancelled by its caller before running.
    #[error("admission cancelled before running")]
    AdmissionCancelled,

    /// Cross-session read or write was attempted. Indicates a bug in the
    /// caller, not a recoverable runtime condition.
    #[error("session isolation violation: {0}")]
    SessionIsolation(String),

    /// Session history grew past its configured bound. Recovered internally
    /// by forced eviction; never surfaced to callers.
    #[error("history bound exceeded for session {0}")]
    HistoryBoundExceeded(String),

    /// Downstream answer generation failed.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if this is a rate limit rejection.
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this failure is backpressure (load shedding) rather than a
    /// fault: queue full, rate limited, or timed out while queued.
    pub const fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::RateLimited { .. } | Self::AdmissionTimeout
        )
    }

    /// Suggested wait before retrying, where one exists.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Get HTTP status code for this error, for whatever transport layer
    /// sits above this core.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::QueueFull { .. } | Self::RateLimited { .. } => 429,
            Self::AdmissionTimeout => 408,
            Self::AdmissionCancelled => 499,
            Self::Generation(_) => 502,
            Self::Config(_) => 400,
            _ => 500,
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Wrap the error as [`Error::Internal`] with a context prefix.
    fn internal_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn internal_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Internal(format!("{}: {}", context.into(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_only_on_rate_limit() {
        let err = Error::RateLimited {
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(Error::AdmissionTimeout.retry_after(), None);
        assert_eq!(Error::QueueFull { queued: 3 }.retry_after(), None);
    }

    #[test]
    fn test_backpressure_classification() {
        assert!(Error::QueueFull { queued: 0 }.is_backpressure());
        assert!(Error::AdmissionTimeout.is_backpressure());
        assert!(!Error::SessionIsolation("s1 vs s2".into()).is_backpressure());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::QueueFull { queued: 1 }.status_code(), 429);
        assert_eq!(Error::AdmissionTimeout.status_code(), 408);
        assert_eq!(Error::Internal("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_internal_context() {
        let res: std::result::Result<(), String> = Err("missing field".into());
        let err = res.internal_context("loading snapshot").unwrap_err();
        assert!(err.to_string().contains("loading snapshot"));
    }
}
