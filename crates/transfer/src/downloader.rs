use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream;
use relaybox_backend::{CallKind, ResilientTransport, StorageBackend};
use relaybox_crypto::{ServerSecret, checksum_bytes, decrypt, derive_chunk_key};
use relaybox_protocol::{ChunkDescriptor, FileId, UploadedFile};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::validation::{sorted_descriptors, validate_uploaded_file};
use crate::{ChunkError, TransferError};

/// Upper bound on the output buffer reserved from declared chunk sizes.
/// Declared sizes are only trusted once each chunk has been verified.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Chunks fetched concurrently during reassembly. Output order is
    /// always by chunk index regardless of completion order.
    pub parallel_fetches: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            parallel_fetches: 1,
        }
    }
}

/// Fetches, verifies and decrypts chunks.
#[derive(Clone)]
pub struct ChunkDownloader {
    backend: Arc<dyn StorageBackend>,
    transport: ResilientTransport,
    secret: Arc<ServerSecret>,
    options: DownloadOptions,
}

impl ChunkDownloader {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        transport: ResilientTransport,
        secret: Arc<ServerSecret>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            backend,
            transport,
            secret,
            options,
        }
    }

    /// Returns the plaintext of one chunk.
    ///
    /// The sealed bytes are hashed before decryption; a mismatch is an
    /// integrity failure and no decryption is attempted.
    pub async fn download_chunk(
        &self,
        file_id: &FileId,
        descriptor: &ChunkDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        let index = descriptor.chunk_index;
        let backend = self.backend.as_ref();

        let file_ref = descriptor.backend_file_ref.as_str();
        let path = self
            .transport
            .call("resolve chunk", CallKind::Request, cancel, move || {
                backend.resolve_file(file_ref)
            })
            .await
            .map_err(|e| TransferError::download(index, e))?;

        let path = path.as_str();
        let sealed = self
            .transport
            .call("download chunk", CallKind::Request, cancel, move || {
                backend.download(path)
            })
            .await
            .map_err(|e| TransferError::download(index, e))?;

        let actual = checksum_bytes(&sealed);
        if !actual.eq_ignore_ascii_case(&descriptor.integrity_hash) {
            warn!(file_id = %file_id, chunk_index = index, "integrity check failed");
            return Err(TransferError::ChunkDownload {
                index,
                source: ChunkError::Integrity {
                    expected: descriptor.integrity_hash.clone(),
                    actual,
                },
            });
        }

        let key = derive_chunk_key(file_id, index, &self.secret);
        let plain = decrypt(&sealed, &key).map_err(|e| TransferError::ChunkDownload {
            index,
            source: e.into(),
        })?;

        if descriptor.plain_size != 0 && plain.len() as u64 != descriptor.plain_size {
            return Err(TransferError::ChunkDownload {
                index,
                source: ChunkError::Size {
                    expected: descriptor.plain_size,
                    actual: plain.len() as u64,
                },
            });
        }

        debug!(file_id = %file_id, chunk_index = index, bytes = plain.len(), "chunk verified");
        Ok(plain)
    }

    /// Rebuilds a file from its descriptors, in any input order.
    ///
    /// The set is validated up front (non-empty, unique, contiguous from 0).
    /// Any chunk failure aborts the whole reassembly and no partial output
    /// is returned.
    pub async fn reassemble_file(
        &self,
        file_id: &FileId,
        descriptors: &[ChunkDescriptor],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        let ordered = sorted_descriptors(file_id, descriptors, None)?;
        self.fetch_ordered(file_id, ordered, cancel).await
    }

    /// Downloads a whole uploaded file, checking chunk count and final size.
    pub async fn download_file(
        &self,
        file: &UploadedFile,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        let ordered = validate_uploaded_file(file)?;
        let data = self.fetch_ordered(&file.file_id, ordered, cancel).await?;
        if data.len() as u64 != file.size {
            return Err(TransferError::LengthMismatch {
                expected: file.size,
                actual: data.len() as u64,
            });
        }
        info!(file_id = %file.file_id, bytes = data.len(), "download complete");
        Ok(data)
    }

    async fn fetch_ordered(
        &self,
        file_id: &FileId,
        ordered: Vec<&ChunkDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        let declared: u64 = ordered.iter().map(|d| d.plain_size).sum();
        let mut out = Vec::with_capacity(declared.min(MAX_PREALLOC) as usize);

        // `buffered` yields in input order, so concatenation stays by index.
        let mut chunks = stream::iter(ordered)
            .map(|d| self.download_chunk(file_id, d, cancel))
            .buffered(self.options.parallel_fetches.max(1));
        while let Some(chunk) = chunks.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}
