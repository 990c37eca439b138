use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use relaybox_backend::{CallKind, ResilientTransport, StorageBackend};
use relaybox_crypto::{ServerSecret, checksum_bytes, derive_chunk_key, encrypt};
use relaybox_protocol::{ChunkDescriptor, FileId, UploadedFile};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chunked::ChunkReader;
use crate::types::UploadCheckpoint;
use crate::validation::sanitize_filename;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Pause between consecutive chunk uploads of one file.
///
/// Grows slightly with the chunk index and carries random jitter so a burst
/// of uploads does not hit the backend's rate limiter in lockstep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterChunkDelay {
    pub base: Duration,
    /// Added per chunk already sent.
    pub growth: Duration,
    pub max_jitter: Duration,
    pub max: Duration,
}

impl Default for InterChunkDelay {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(800),
            growth: Duration::from_millis(50),
            max_jitter: Duration::from_millis(400),
            max: Duration::from_secs(5),
        }
    }
}

impl InterChunkDelay {
    /// No pause at all.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            growth: Duration::ZERO,
            max_jitter: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Pause before uploading chunk `next_index`.
    pub fn before(&self, next_index: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base
            .saturating_add(self.growth.saturating_mul(next_index))
            .saturating_add(jitter)
            .min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    pub inter_chunk_delay: InterChunkDelay,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inter_chunk_delay: InterChunkDelay::default(),
        }
    }
}

/// Backend filename for chunk `index` of a file: `{name}.part{index:04}`.
pub fn chunk_filename(hint: &str, index: u32) -> String {
    format!("{}.part{index:04}", sanitize_filename(hint))
}

/// Encrypts and uploads chunks.
#[derive(Clone)]
pub struct ChunkUploader {
    backend: Arc<dyn StorageBackend>,
    transport: ResilientTransport,
    secret: Arc<ServerSecret>,
    options: UploadOptions,
}

impl ChunkUploader {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        transport: ResilientTransport,
        secret: Arc<ServerSecret>,
        options: UploadOptions,
    ) -> Self {
        Self {
            backend,
            transport,
            secret,
            options,
        }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Seals one chunk and commits it to the backend.
    ///
    /// The integrity hash covers the sealed bytes exactly as transmitted.
    pub async fn upload_chunk(
        &self,
        file_id: &FileId,
        chunk_index: u32,
        data: &[u8],
        filename_hint: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkDescriptor, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let key = derive_chunk_key(file_id, chunk_index, &self.secret);
        let sealed = encrypt(data, &key);
        let integrity_hash = checksum_bytes(&sealed);
        let name = chunk_filename(filename_hint, chunk_index);

        let backend = self.backend.as_ref();
        let (filename, payload) = (name.as_str(), sealed.as_slice());
        let receipt = self
            .transport
            .call("upload chunk", CallKind::Upload, cancel, move || {
                backend.upload_document(filename, payload)
            })
            .await
            .map_err(|e| TransferError::upload(chunk_index, e))?;

        debug!(
            file_id = %file_id,
            chunk_index,
            sealed_bytes = sealed.len(),
            file_ref = %receipt.file_ref,
            "chunk committed"
        );

        Ok(ChunkDescriptor {
            chunk_id: file_id.chunk_id(chunk_index),
            chunk_index,
            backend_message_ref: receipt.message_ref,
            integrity_hash,
            backend_file_ref: receipt.file_ref,
            plain_size: data.len() as u64,
        })
    }

    /// Validates `data` and mints a fresh file id for it.
    pub fn begin_upload(&self, data: &[u8], filename: &str) -> Result<UploadCheckpoint, TransferError> {
        let reader = ChunkReader::new(data, self.options.chunk_size)?;
        Ok(UploadCheckpoint::new(
            FileId::generate(),
            filename,
            data.len() as u64,
            reader.total_chunks(),
        ))
    }

    /// Uploads a whole file under a new file id.
    pub async fn upload_file(
        &self,
        data: &[u8],
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadedFile, TransferError> {
        let mut checkpoint = self.begin_upload(data, filename)?;
        self.resume_upload(data, &mut checkpoint, cancel).await?;
        checkpoint.into_uploaded_file()
    }

    /// Uploads the chunks of `data` not yet recorded in `checkpoint`.
    ///
    /// Chunks go up strictly in index order; on failure the checkpoint holds
    /// every chunk committed so far and can be resumed later.
    pub async fn resume_upload(
        &self,
        data: &[u8],
        checkpoint: &mut UploadCheckpoint,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut reader = ChunkReader::new(data, self.options.chunk_size)?;
        if reader.total_chunks() != checkpoint.total_chunks()
            || data.len() as u64 != checkpoint.size()
        {
            return Err(TransferError::InvalidDescriptors(
                "checkpoint does not match the file".into(),
            ));
        }

        let start = checkpoint.next_index();
        reader.seek_to(start);
        if start > 0 {
            info!(
                file_id = %checkpoint.file_id(),
                start,
                total = checkpoint.total_chunks(),
                "resuming upload"
            );
        }

        for chunk in reader {
            if chunk.index > start {
                self.wait_between_chunks(chunk.index, cancel).await?;
            }
            let descriptor = self
                .upload_chunk(
                    checkpoint.file_id(),
                    chunk.index,
                    chunk.data,
                    checkpoint.filename(),
                    cancel,
                )
                .await?;
            checkpoint.record(descriptor)?;
        }

        info!(
            file_id = %checkpoint.file_id(),
            chunks = checkpoint.total_chunks(),
            bytes = checkpoint.size(),
            "upload complete"
        );
        Ok(())
    }

    /// Sleeps the inter-chunk delay before `next_index`, waking early on
    /// cancellation.
    pub async fn wait_between_chunks(
        &self,
        next_index: u32,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let delay = self.options.inter_chunk_delay.before(next_index);
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybox_backend::{MemoryBackend, Operation, TransportConfig};
    use relaybox_crypto::{decrypt, derive_chunk_key};

    fn secret() -> Arc<ServerSecret> {
        Arc::new(ServerSecret::new(b"0123456789abcdef0123456789abcdef".to_vec()).unwrap())
    }

    fn fast_transport() -> ResilientTransport {
        ResilientTransport::new(TransportConfig {
            base_delay: Duration::from_millis(10),
            max_jitter: Duration::ZERO,
            ..TransportConfig::default()
        })
    }

    fn uploader(backend: Arc<MemoryBackend>, chunk_size: usize) -> ChunkUploader {
        ChunkUploader::new(
            backend,
            fast_transport(),
            secret(),
            UploadOptions {
                chunk_size,
                inter_chunk_delay: InterChunkDelay::none(),
            },
        )
    }

    #[test]
    fn chunk_filenames() {
        assert_eq!(chunk_filename("movie.mkv", 3), "movie.mkv.part0003");
        assert_eq!(chunk_filename("../x", 12), "x.part0012");
    }

    #[test]
    fn inter_chunk_delay_grows_and_caps() {
        let delay = InterChunkDelay {
            base: Duration::from_millis(800),
            growth: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
            max: Duration::from_secs(2),
        };
        assert_eq!(delay.before(1), Duration::from_millis(900));
        assert_eq!(delay.before(5), Duration::from_millis(1300));
        assert_eq!(delay.before(100), Duration::from_secs(2));
        assert_eq!(InterChunkDelay::none().before(7), Duration::ZERO);

        let jittery = InterChunkDelay::default();
        for i in 0..20 {
            let d = jittery.before(i);
            assert!(d >= jittery.base && d <= jittery.max);
        }
    }

    #[tokio::test]
    async fn descriptor_hash_covers_sealed_bytes() {
        let backend = Arc::new(MemoryBackend::new());
        let up = uploader(Arc::clone(&backend), 16);
        let id = FileId::from("file-1");
        let cancel = CancellationToken::new();

        let d = up
            .upload_chunk(&id, 4, b"hello chunk", "notes.txt", &cancel)
            .await
            .unwrap();
        assert_eq!(d.chunk_id, "file-1_4");
        assert_eq!(d.chunk_index, 4);
        assert_eq!(d.plain_size, 11);

        let blob = backend.blob(&d.backend_file_ref).unwrap();
        assert_eq!(checksum_bytes(&blob), d.integrity_hash);
        let key = derive_chunk_key(&id, 4, &secret());
        assert_eq!(decrypt(&blob, &key).unwrap(), b"hello chunk");
        assert_eq!(backend.uploaded_names(), vec!["notes.txt.part0004".to_string()]);
    }

    #[tokio::test]
    async fn splits_into_ordered_chunks() {
        let backend = Arc::new(MemoryBackend::new());
        let up = uploader(Arc::clone(&backend), 4);
        let data: Vec<u8> = (0..10).collect();

        let file = up
            .upload_file(&data, "ten.bin", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(file.size, 10);
        assert_eq!(file.total_chunks, 3);
        let indices: Vec<u32> = file.chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let sizes: Vec<u64> = file.chunks.iter().map(|c| c.plain_size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(backend.calls(Operation::Upload), 3);
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let up = uploader(Arc::clone(&backend), 4);
        let err = up
            .upload_file(&[], "empty", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::EmptyFile));
        assert_eq!(backend.calls(Operation::Upload), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reports_chunk_and_resume_continues() {
        let backend = Arc::new(MemoryBackend::new());
        let up = uploader(Arc::clone(&backend), 4);
        let data = vec![9u8; 12];
        let cancel = CancellationToken::new();

        let mut checkpoint = up.begin_upload(&data, "f.bin").unwrap();
        let first = up
            .upload_chunk(checkpoint.file_id(), 0, &data[..4], "f.bin", &cancel)
            .await
            .unwrap();
        checkpoint.record(first).unwrap();

        backend.fail_always(Operation::Upload, 403);
        let err = up
            .resume_upload(&data, &mut checkpoint, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.chunk_index(), Some(1));
        assert!(!err.is_transient());
        assert_eq!(checkpoint.next_index(), 1);

        backend.clear_failures();
        let file_id = checkpoint.file_id().clone();
        up.resume_upload(&data, &mut checkpoint, &cancel).await.unwrap();
        let file = checkpoint.into_uploaded_file().unwrap();
        assert_eq!(file.file_id, file_id);
        assert_eq!(file.chunks.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhaustion_is_classified() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_always(Operation::Upload, 503);
        let up = uploader(Arc::clone(&backend), 4);

        let err = up
            .upload_file(b"abcdef", "x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.chunk_index(), Some(0));
        assert_eq!(backend.calls(Operation::Upload), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_inter_chunk_delay() {
        let backend = Arc::new(MemoryBackend::new());
        let up = ChunkUploader::new(
            Arc::clone(&backend) as Arc<dyn StorageBackend>,
            fast_transport(),
            secret(),
            UploadOptions {
                chunk_size: 4,
                inter_chunk_delay: InterChunkDelay {
                    base: Duration::from_secs(3),
                    growth: Duration::ZERO,
                    max_jitter: Duration::ZERO,
                    max: Duration::from_secs(3),
                },
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = up.upload_file(&[1u8; 12], "x", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(backend.calls(Operation::Upload), 1);
    }

    #[tokio::test]
    async fn checkpoint_must_match_file() {
        let backend = Arc::new(MemoryBackend::new());
        let up = uploader(backend, 4);
        let mut checkpoint = up.begin_upload(&[0u8; 8], "a").unwrap();
        let err = up
            .resume_upload(&[0u8; 12], &mut checkpoint, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidDescriptors(_)));
    }
}
