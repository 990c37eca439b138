use std::sync::Arc;

use relaybox_backend::{ResilientTransport, StorageBackend, TransportConfig};
use relaybox_crypto::ServerSecret;
use relaybox_protocol::UploadedFile;
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::downloader::{ChunkDownloader, DownloadOptions};
use crate::uploader::{ChunkUploader, UploadOptions};

/// Uploader and downloader sharing one backend, transport policy and
/// server secret.
#[derive(Clone)]
pub struct Gateway {
    uploader: ChunkUploader,
    downloader: ChunkDownloader,
}

impl Gateway {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        transport: TransportConfig,
        secret: Arc<ServerSecret>,
        upload: UploadOptions,
        download: DownloadOptions,
    ) -> Self {
        let transport = ResilientTransport::new(transport);
        Self {
            uploader: ChunkUploader::new(
                Arc::clone(&backend),
                transport.clone(),
                Arc::clone(&secret),
                upload,
            ),
            downloader: ChunkDownloader::new(backend, transport, secret, download),
        }
    }

    pub fn uploader(&self) -> &ChunkUploader {
        &self.uploader
    }

    pub fn downloader(&self) -> &ChunkDownloader {
        &self.downloader
    }

    pub async fn upload_file(
        &self,
        data: &[u8],
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadedFile, TransferError> {
        self.uploader.upload_file(data, filename, cancel).await
    }

    pub async fn download_file(
        &self,
        file: &UploadedFile,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        self.downloader.download_file(file, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::InterChunkDelay;
    use relaybox_backend::MemoryBackend;

    #[tokio::test]
    async fn round_trip_through_gateway() {
        let gateway = Gateway::new(
            Arc::new(MemoryBackend::new()),
            TransportConfig::default(),
            Arc::new(ServerSecret::new(vec![7u8; 32]).unwrap()),
            UploadOptions {
                chunk_size: 1024,
                inter_chunk_delay: InterChunkDelay::none(),
            },
            DownloadOptions::default(),
        );
        let cancel = CancellationToken::new();
        let data = vec![0xA5u8; 3000];
        let file = gateway.upload_file(&data, "blob.bin", &cancel).await.unwrap();
        assert_eq!(file.total_chunks, 3);
        assert_eq!(gateway.download_file(&file, &cancel).await.unwrap(), data);
    }
}
