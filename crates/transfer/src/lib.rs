//! Chunked, encrypted file transfer over a [`StorageBackend`].
//!
//! Uploads split a buffer into fixed-size chunks, seal each one under its
//! own derived key and record a [`ChunkDescriptor`] per chunk. Downloads
//! verify the integrity hash of every sealed chunk before decrypting and
//! concatenate strictly by chunk index.
//!
//! [`StorageBackend`]: relaybox_backend::StorageBackend
//! [`ChunkDescriptor`]: relaybox_protocol::ChunkDescriptor

mod chunked;
mod downloader;
mod gateway;
mod progress;
mod types;
mod uploader;
mod validation;

pub use chunked::{ChunkReader, PlainChunk, total_chunks};
pub use downloader::{ChunkDownloader, DownloadOptions};
pub use gateway::Gateway;
pub use progress::ThroughputMeter;
pub use types::UploadCheckpoint;
pub use uploader::{ChunkUploader, InterChunkDelay, UploadOptions, chunk_filename};
pub use validation::{sanitize_filename, sorted_descriptors, validate_uploaded_file};

pub use relaybox_protocol::constants::DEFAULT_CHUNK_SIZE;

use relaybox_backend::TransportError;
use relaybox_crypto::CryptoError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file is empty")]
    EmptyFile,

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("invalid chunk set: {0}")]
    InvalidDescriptors(String),

    #[error("chunk {index} upload failed: {source}")]
    ChunkUpload { index: u32, source: ChunkError },

    #[error("chunk {index} download failed: {source}")]
    ChunkDownload { index: u32, source: ChunkError },

    #[error("reassembled {actual} bytes, expected {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("cancelled")]
    Cancelled,
}

/// Cause of a single chunk failing.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error(transparent)]
    Transport(TransportError),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error(transparent)]
    Decryption(#[from] CryptoError),

    #[error("decrypted {actual} bytes, descriptor says {expected}")]
    Size { expected: u64, actual: u64 },
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Chunk bytes were tampered with or undecryptable.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self.chunk_error(),
            Some(ChunkError::Integrity { .. } | ChunkError::Decryption(_) | ChunkError::Size { .. })
        )
    }

    /// Transient backend trouble that outlasted the retry budget; safe to
    /// retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.chunk_error(),
            Some(ChunkError::Transport(TransportError::Exhausted { .. }))
        )
    }

    /// Index of the failing chunk, if the error is chunk-scoped.
    pub fn chunk_index(&self) -> Option<u32> {
        match self {
            Self::ChunkUpload { index, .. } | Self::ChunkDownload { index, .. } => Some(*index),
            _ => None,
        }
    }

    fn chunk_error(&self) -> Option<&ChunkError> {
        match self {
            Self::ChunkUpload { source, .. } | Self::ChunkDownload { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Maps a transport failure on chunk `index`; cancellation stays
    /// unwrapped so callers can tell it apart from a failed chunk.
    pub(crate) fn upload(index: u32, err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => Self::Cancelled,
            other => Self::ChunkUpload {
                index,
                source: ChunkError::Transport(other),
            },
        }
    }

    pub(crate) fn download(index: u32, err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => Self::Cancelled,
            other => Self::ChunkDownload {
                index,
                source: ChunkError::Transport(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybox_backend::BackendError;

    fn exhausted() -> TransportError {
        TransportError::Exhausted {
            operation: "upload chunk".into(),
            attempts: 5,
            last: BackendError::Status {
                status: 503,
                body: "unavailable".into(),
                retry_after: None,
            },
        }
    }

    #[test]
    fn cancellation_is_not_wrapped() {
        assert!(TransferError::upload(3, TransportError::Cancelled).is_cancelled());
        assert!(TransferError::download(3, TransportError::Cancelled).is_cancelled());
    }

    #[test]
    fn classification() {
        let transient = TransferError::upload(2, exhausted());
        assert!(transient.is_transient());
        assert!(!transient.is_integrity());
        assert_eq!(transient.chunk_index(), Some(2));
        assert!(transient.to_string().contains("chunk 2 upload failed"));

        let integrity = TransferError::ChunkDownload {
            index: 1,
            source: ChunkError::Integrity {
                expected: "aa".into(),
                actual: "bb".into(),
            },
        };
        assert!(integrity.is_integrity());
        assert!(!integrity.is_transient());

        assert!(!TransferError::EmptyFile.is_transient());
        assert_eq!(TransferError::EmptyFile.chunk_index(), None);
    }
}
