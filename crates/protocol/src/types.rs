use std::fmt;

use serde::{Deserialize, Serialize};

/// Random identifier minted once per logical file.
///
/// Root of the per-chunk key derivation; losing it makes every chunk of the
/// file undecryptable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Mints a new random (UUID v4) file identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bookkeeping id of the chunk at `chunk_index`: `{fileId}_{chunkIndex}`.
    pub fn chunk_id(&self, chunk_index: u32) -> String {
        format!("{}_{chunk_index}", self.0)
    }
}

impl From<String> for FileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One encrypted chunk already committed to the backend.
///
/// Immutable once created. Reassembly order always comes from
/// `chunk_index`, never from position in a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub chunk_id: String,
    pub chunk_index: u32,
    /// Backend-assigned message reference. Informational only.
    #[serde(default)]
    pub backend_message_ref: String,
    /// Hex SHA-256 of the encrypted bytes as transmitted.
    pub integrity_hash: String,
    /// Backend content handle; required for retrieval.
    pub backend_file_ref: String,
    /// Plaintext length of this chunk.
    #[serde(default)]
    pub plain_size: u64,
}

/// Result of a whole-file upload: everything needed to download it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub file_id: FileId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u64,
    pub total_chunks: u32,
    pub chunks: Vec<ChunkDescriptor>,
}

/// Direction of a tracked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Lifecycle state of a tracked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Pending,
    Active,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl TransferState {
    /// `completed` and `cancelled` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns `true` if the transfer is not waiting for or holding a slot.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Paused | Self::Completed | Self::Error | Self::Cancelled
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Observational progress of a transfer, recomputed after every chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub chunks_completed: u32,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Active time spent on the transfer so far.
    pub elapsed_ms: u64,
    /// Bytes per second over the whole transfer so far.
    pub throughput_bps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
}

impl TransferProgress {
    /// Returns the progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_file_ids_are_unique_uuids() {
        let a = FileId::generate();
        let b = FileId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn chunk_id_is_composite() {
        let id = FileId::from("abc");
        assert_eq!(id.chunk_id(7), "abc_7");
    }

    #[test]
    fn descriptor_field_names() {
        let json = r#"{"chunkId":"f_0","chunkIndex":0,"backendMessageRef":"12","integrityHash":"aa","backendFileRef":"doc-1","plainSize":5}"#;
        let d: ChunkDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.chunk_index, 0);
        assert_eq!(d.backend_file_ref, "doc-1");
        assert_eq!(d.plain_size, 5);
    }

    #[test]
    fn uploaded_file_serializes_file_id_as_string() {
        let file = UploadedFile {
            file_id: FileId::from("f1"),
            name: String::new(),
            size: 0,
            total_chunks: 0,
            chunks: vec![],
        };
        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains(r#""fileId":"f1""#));
        assert!(!json.contains("name"));
    }

    #[test]
    fn transfer_state_serialization() {
        assert_eq!(
            serde_json::to_string(&TransferState::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(TransferState::Paused.to_string(), "paused");
    }

    #[test]
    fn terminal_states() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(!TransferState::Error.is_terminal());
        assert!(TransferState::Error.is_settled());
        assert!(!TransferState::Active.is_settled());
    }

    #[test]
    fn progress_percentage() {
        let p = TransferProgress {
            bytes_transferred: 500,
            total_bytes: 1000,
            ..Default::default()
        };
        assert!((p.percentage() - 50.0).abs() < f64::EPSILON);
        assert!((TransferProgress::default().percentage() - 0.0).abs() < f64::EPSILON);
    }
}
