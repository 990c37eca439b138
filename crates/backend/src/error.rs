//! Backend and transport error types.

use std::time::Duration;

use relaybox_protocol::constants::is_retryable_status;

/// Outcome of a single failed backend attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed backend response: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Returns `true` for rate limits, gateway errors, timeouts and
    /// connection failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Protocol(_) => false,
        }
    }

    /// Backend-supplied wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP-like status code, if the backend answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The request URL is stripped first: it embeds the bot credential.
impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if let Some(status) = err.status() {
            return Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
                retry_after: None,
            };
        }
        if err.is_decode() {
            return Self::Protocol(err.to_string());
        }
        Self::Connection(err.to_string())
    }
}

/// Final outcome of a transport call that did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: BackendError,
    },

    #[error("{operation} failed permanently: {source}")]
    Permanent {
        operation: String,
        source: BackendError,
    },

    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Status code of the last backend answer, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Exhausted { last, .. } => last.status(),
            Self::Permanent { source, .. } => source.status(),
            Self::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> BackendError {
        BackendError::Status {
            status: code,
            body: "body".into(),
            retry_after: None,
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(BackendError::Connection("reset".into()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BackendError::Protocol("bad json".into()).is_retryable());
    }

    #[test]
    fn status_preserved_through_transport_error() {
        let err = TransportError::Permanent {
            operation: "upload".into(),
            source: status(403),
        };
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("body"));
        assert_eq!(TransportError::Cancelled.status(), None);
    }
}
