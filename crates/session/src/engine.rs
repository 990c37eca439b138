//! Chunk engine trait.
//!
//! The manager is handed an `Arc<dyn ChunkEngine>` at construction and
//! calls back into it for every chunk. [`Gateway`] is the production
//! implementation; tests supply scripted engines.

use std::future::Future;
use std::pin::Pin;

use relaybox_protocol::{ChunkDescriptor, FileId};
use relaybox_transfer::{Gateway, TransferError};
use tokio_util::sync::CancellationToken;

pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Per-chunk operations the manager drives.
pub trait ChunkEngine: Send + Sync {
    /// Chunk size applied to newly enqueued uploads.
    fn chunk_size(&self) -> usize;

    /// Seals and commits one chunk.
    fn upload_chunk<'a>(
        &'a self,
        file_id: &'a FileId,
        chunk_index: u32,
        data: &'a [u8],
        filename: &'a str,
        cancel: &'a CancellationToken,
    ) -> EngineFuture<'a, ChunkDescriptor>;

    /// Pause before uploading `next_index`; must end early on cancel.
    fn wait_between_chunks<'a>(
        &'a self,
        next_index: u32,
        cancel: &'a CancellationToken,
    ) -> EngineFuture<'a, ()>;

    /// Fetches, verifies and decrypts one chunk.
    fn download_chunk<'a>(
        &'a self,
        file_id: &'a FileId,
        descriptor: &'a ChunkDescriptor,
        cancel: &'a CancellationToken,
    ) -> EngineFuture<'a, Vec<u8>>;
}

impl ChunkEngine for Gateway {
    fn chunk_size(&self) -> usize {
        self.uploader().options().chunk_size
    }

    fn upload_chunk<'a>(
        &'a self,
        file_id: &'a FileId,
        chunk_index: u32,
        data: &'a [u8],
        filename: &'a str,
        cancel: &'a CancellationToken,
    ) -> EngineFuture<'a, ChunkDescriptor> {
        Box::pin(
            self.uploader()
                .upload_chunk(file_id, chunk_index, data, filename, cancel),
        )
    }

    fn wait_between_chunks<'a>(
        &'a self,
        next_index: u32,
        cancel: &'a CancellationToken,
    ) -> EngineFuture<'a, ()> {
        Box::pin(self.uploader().wait_between_chunks(next_index, cancel))
    }

    fn download_chunk<'a>(
        &'a self,
        file_id: &'a FileId,
        descriptor: &'a ChunkDescriptor,
        cancel: &'a CancellationToken,
    ) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(self.downloader().download_chunk(file_id, descriptor, cancel))
    }
}
