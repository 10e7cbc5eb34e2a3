//! Structured error types for the dispatch pipeline.
//!
//! `RuninatorError` is the pattern-matchable surface shared by the broker,
//! scheduler, worker, and clients. Service loops classify errors through
//! [`RuninatorError::is_retryable`] to decide between requeue and drop;
//! `anyhow` remains the transport inside binaries.

use thiserror::Error;

use crate::cron::CronParseError;

/// Error surface for broker, scheduler, worker, and client operations.
#[derive(Debug, Error)]
pub enum RuninatorError {
    /// A cron expression failed to parse.
    #[error(transparent)]
    CronParse(#[from] CronParseError),

    /// Bad CLI flags or environment.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient I/O failure talking to a remote service.
    #[error("network error: {0}")]
    Network(String),

    /// A 4xx/5xx reply from the broker or the web service.
    #[error("remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// An ack/nack was rejected because the lease token no longer matches.
    #[error("lease token is no longer valid")]
    LeaseStale,

    /// No handler is registered for the requested action.
    #[error("no handler registered for {action_name}/{action_function}")]
    HandlerNotFound {
        action_name: String,
        action_function: String,
    },

    /// A handler ran and reported failure.
    #[error("handler failed: {message}")]
    HandlerFailed { message: String, retryable: bool },

    /// A deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Shutdown was requested while the operation was in flight.
    #[error("shutdown requested")]
    Shutdown,
}

impl RuninatorError {
    /// Whether a firing that failed with this error should be requeued.
    ///
    /// Validation-shaped errors (bad cron, missing handler, non-retryable
    /// handler failures, remote 4xx) drop the firing; everything else is
    /// worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuninatorError::CronParse(_)
            | RuninatorError::Config(_)
            | RuninatorError::LeaseStale
            | RuninatorError::HandlerNotFound { .. }
            | RuninatorError::Shutdown => false,
            RuninatorError::HandlerFailed { retryable, .. } => *retryable,
            RuninatorError::Remote { status, .. } => *status >= 500,
            RuninatorError::Network(_) | RuninatorError::Timeout => true,
        }
    }
}

impl From<reqwest::Error> for RuninatorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RuninatorError::Timeout
        } else if let Some(status) = e.status() {
            RuninatorError::Remote {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            RuninatorError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_classification() {
        assert!(RuninatorError::Network("reset".into()).is_retryable());
        assert!(RuninatorError::Timeout.is_retryable());
        assert!(RuninatorError::Remote {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());

        assert!(!RuninatorError::Remote {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!RuninatorError::LeaseStale.is_retryable());
        assert!(!RuninatorError::HandlerNotFound {
            action_name: "Console".into(),
            action_function: "missing".into()
        }
        .is_retryable());
        assert!(RuninatorError::HandlerFailed {
            message: "flaky".into(),
            retryable: true
        }
        .is_retryable());
    }
}
