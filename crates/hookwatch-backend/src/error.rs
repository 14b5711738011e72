//! Backend failure taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by backend clients and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Transport failure or non-success HTTP status.
    #[error("connection error: {0}")]
    Connection(String),
    /// Request exceeded the configured timeout.
    #[error("request timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    /// Configuration defect.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl BackendError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    /// Map a reqwest failure, attributing timeouts to `timeout`. The message
    /// includes the whole source chain.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            return Self::Timeout(timeout);
        }
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::Connection(message)
    }

    /// Check if the reconnection policy should retry this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Run `fut` bounded by `timeout`.
///
/// # Errors
/// Returns `BackendError::Timeout` when the deadline passes first.
pub async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| BackendError::Timeout(timeout))?
}
