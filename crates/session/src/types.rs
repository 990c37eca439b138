//! Session manager types.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relaybox_protocol::constants::{
    DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_RETRY_ATTEMPTS, RETRY_CEILING_FACTOR,
};
use relaybox_protocol::{FileId, TransferDirection, TransferProgress, TransferState, UploadedFile};
use relaybox_transfer::TransferError;
use serde::Serialize;

/// Manager-assigned transfer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TransferId(pub(crate) u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Backend trouble that outlasted the transport's retry budget.
    Transient,
    /// Stored bytes failed verification or decryption.
    Integrity,
    /// Rejected by the backend or invalid input.
    Permanent,
}

/// Failure recorded on a transfer in the `error` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    /// Set once automatic retries hit the ceiling.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retries_exhausted: bool,
}

impl TransferFailure {
    pub fn from_error(err: &TransferError) -> Self {
        let kind = if err.is_integrity() || matches!(err, TransferError::LengthMismatch { .. }) {
            FailureKind::Integrity
        } else if err.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        };
        Self {
            kind,
            message: err.to_string(),
            chunk_index: err.chunk_index(),
            retries_exhausted: false,
        }
    }

    /// Only transient failures may clear up on their own, and only while
    /// automatic retries remain.
    pub fn requires_manual_intervention(&self) -> bool {
        self.kind != FailureKind::Transient || self.retries_exhausted
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if self.retries_exhausted {
            f.write_str(" (automatic retries exhausted)")?;
        }
        if self.requires_manual_intervention() {
            f.write_str(" (requires manual intervention)")?;
        }
        Ok(())
    }
}

/// Snapshot of one tracked transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: TransferId,
    pub name: String,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub file_id: FileId,
    pub progress: TransferProgress,
    /// Manager-level retries, independent of transport attempts.
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TransferFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutput {
    /// Manifest of a finished upload.
    Uploaded(UploadedFile),
    /// Reassembled plaintext of a finished download.
    Downloaded(Arc<[u8]>),
}

/// Events emitted by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StateChanged {
        id: TransferId,
        state: TransferState,
        failure: Option<TransferFailure>,
    },
    /// One more chunk finished.
    Progress {
        id: TransferId,
        chunk_index: u32,
        progress: TransferProgress,
    },
    Removed {
        id: TransferId,
    },
}

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrent_transfers: usize,
    /// Re-queue transient failures automatically until `retry_ceiling`.
    pub auto_retry: bool,
    pub retry_ceiling: u32,
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            auto_retry: false,
            retry_ceiling: DEFAULT_RETRY_ATTEMPTS * RETRY_CEILING_FACTOR,
            event_capacity: 256,
        }
    }
}

impl ManagerConfig {
    /// Ceiling derived from a transport retry budget.
    pub fn with_transport_retries(mut self, retries: u32) -> Self {
        self.retry_ceiling = retries.saturating_mul(RETRY_CEILING_FACTOR);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybox_backend::{BackendError, TransportError};
    use relaybox_transfer::ChunkError;

    #[test]
    fn classifies_failures() {
        let transient = TransferError::ChunkUpload {
            index: 2,
            source: ChunkError::Transport(TransportError::Exhausted {
                operation: "upload chunk".into(),
                attempts: 5,
                last: BackendError::Timeout(std::time::Duration::from_secs(120)),
            }),
        };
        let f = TransferFailure::from_error(&transient);
        assert_eq!(f.kind, FailureKind::Transient);
        assert_eq!(f.chunk_index, Some(2));
        assert!(!f.requires_manual_intervention());

        let integrity = TransferError::ChunkDownload {
            index: 0,
            source: ChunkError::Integrity {
                expected: "a".into(),
                actual: "b".into(),
            },
        };
        let f = TransferFailure::from_error(&integrity);
        assert_eq!(f.kind, FailureKind::Integrity);
        assert!(f.to_string().ends_with("(requires manual intervention)"));

        let length = TransferError::LengthMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(TransferFailure::from_error(&length).kind, FailureKind::Integrity);

        let permanent = TransferError::ChunkUpload {
            index: 0,
            source: ChunkError::Transport(TransportError::Permanent {
                operation: "upload chunk".into(),
                source: BackendError::Status {
                    status: 403,
                    body: "Forbidden".into(),
                    retry_after: None,
                },
            }),
        };
        assert_eq!(TransferFailure::from_error(&permanent).kind, FailureKind::Permanent);
    }

    #[test]
    fn retry_ceiling_defaults_to_twice_transport_budget() {
        assert_eq!(ManagerConfig::default().retry_ceiling, 8);
        assert_eq!(ManagerConfig::default().with_transport_retries(2).retry_ceiling, 4);
    }

    #[test]
    fn record_serializes_camel_case() {
        let now = Utc::now();
        let record = TransferRecord {
            id: TransferId(7),
            name: "a.bin".into(),
            direction: TransferDirection::Upload,
            state: TransferState::Active,
            file_id: FileId::from("f"),
            progress: TransferProgress::default(),
            retry_count: 1,
            failure: None,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""id":7"#));
        assert!(json.contains(r#""retryCount":1"#));
        assert!(json.contains(r#""state":"active""#));
        assert!(!json.contains("failure"));
        assert_eq!(TransferId(7).to_string(), "t7");
    }
}
