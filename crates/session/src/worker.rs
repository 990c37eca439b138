//! Per-transfer worker tasks.
//!
//! A worker runs one attempt of one transfer from its first missing chunk
//! and reports every finished chunk back to the scheduler before moving on,
//! so a pause never loses committed work.

use std::sync::Arc;

use relaybox_protocol::{ChunkDescriptor, FileId, UploadedFile};
use relaybox_transfer::{ChunkReader, TransferError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::ChunkEngine;
use crate::types::TransferId;

/// Messages from workers to the scheduler.
#[derive(Debug)]
pub(crate) enum Update {
    Uploaded {
        id: TransferId,
        descriptor: ChunkDescriptor,
    },
    Downloaded {
        id: TransferId,
        chunk_index: u32,
        data: Vec<u8>,
    },
    Finished {
        id: TransferId,
        outcome: Result<(), TransferError>,
    },
}

/// What a worker has to do, cut from the scheduler's record.
pub(crate) enum WorkOrder {
    Upload {
        data: Arc<[u8]>,
        file_id: FileId,
        filename: String,
        chunk_size: usize,
        start: u32,
    },
    Download {
        /// Chunks already sorted by index.
        file: Arc<UploadedFile>,
        start: u32,
    },
}

pub(crate) fn spawn(
    id: TransferId,
    order: WorkOrder,
    engine: Arc<dyn ChunkEngine>,
    cancel: CancellationToken,
    updates: mpsc::Sender<Update>,
) {
    tokio::spawn(async move {
        let outcome = match order {
            WorkOrder::Upload {
                data,
                file_id,
                filename,
                chunk_size,
                start,
            } => {
                upload(
                    id,
                    engine.as_ref(),
                    &data,
                    &file_id,
                    &filename,
                    chunk_size,
                    start,
                    &cancel,
                    &updates,
                )
                .await
            }
            WorkOrder::Download { file, start } => {
                download(id, engine.as_ref(), &file, start, &cancel, &updates).await
            }
        };
        debug!(transfer = %id, ok = outcome.is_ok(), "worker finished");
        // The scheduler only goes away on shutdown.
        let _ = updates.send(Update::Finished { id, outcome }).await;
    });
}

#[allow(clippy::too_many_arguments)]
async fn upload(
    id: TransferId,
    engine: &dyn ChunkEngine,
    data: &[u8],
    file_id: &FileId,
    filename: &str,
    chunk_size: usize,
    start: u32,
    cancel: &CancellationToken,
    updates: &mpsc::Sender<Update>,
) -> Result<(), TransferError> {
    let mut reader = ChunkReader::new(data, chunk_size)?;
    reader.seek_to(start);
    for chunk in reader {
        if chunk.index > start {
            engine.wait_between_chunks(chunk.index, cancel).await?;
        }
        let descriptor = engine
            .upload_chunk(file_id, chunk.index, chunk.data, filename, cancel)
            .await?;
        if updates
            .send(Update::Uploaded { id, descriptor })
            .await
            .is_err()
        {
            return Err(TransferError::Cancelled);
        }
    }
    Ok(())
}

async fn download(
    id: TransferId,
    engine: &dyn ChunkEngine,
    file: &UploadedFile,
    start: u32,
    cancel: &CancellationToken,
    updates: &mpsc::Sender<Update>,
) -> Result<(), TransferError> {
    for descriptor in file.chunks.iter().skip(start as usize) {
        let data = engine
            .download_chunk(&file.file_id, descriptor, cancel)
            .await?;
        let update = Update::Downloaded {
            id,
            chunk_index: descriptor.chunk_index,
            data,
        };
        if updates.send(update).await.is_err() {
            return Err(TransferError::Cancelled);
        }
    }
    Ok(())
}
