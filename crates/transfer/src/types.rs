use relaybox_protocol::{ChunkDescriptor, FileId, UploadedFile};

use crate::TransferError;

/// Resumable state of an upload in progress.
///
/// Chunks commit strictly in index order, so the descriptors held here are
/// always `0..next_index()`. Resuming from a checkpoint reuses the same
/// file id, which keeps every derived chunk key stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCheckpoint {
    file_id: FileId,
    filename: String,
    size: u64,
    total_chunks: u32,
    chunks: Vec<ChunkDescriptor>,
}

impl UploadCheckpoint {
    pub fn new(file_id: FileId, filename: impl Into<String>, size: u64, total_chunks: u32) -> Self {
        Self {
            file_id,
            filename: filename.into(),
            size,
            total_chunks,
            chunks: Vec::with_capacity(total_chunks as usize),
        }
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Index of the first chunk not yet committed.
    pub fn next_index(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.next_index() == self.total_chunks
    }

    /// Appends the descriptor of the next chunk.
    pub fn record(&mut self, descriptor: ChunkDescriptor) -> Result<(), TransferError> {
        let expected = self.next_index();
        if descriptor.chunk_index != expected {
            return Err(TransferError::InvalidDescriptors(format!(
                "expected chunk {expected}, got {}",
                descriptor.chunk_index
            )));
        }
        if expected >= self.total_chunks {
            return Err(TransferError::InvalidDescriptors(format!(
                "file has only {} chunks",
                self.total_chunks
            )));
        }
        self.chunks.push(descriptor);
        Ok(())
    }

    /// Finishes the upload. Fails unless every chunk is committed.
    pub fn into_uploaded_file(self) -> Result<UploadedFile, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::InvalidDescriptors(format!(
                "upload incomplete: {} of {} chunks",
                self.next_index(),
                self.total_chunks
            )));
        }
        Ok(UploadedFile {
            file_id: self.file_id,
            name: self.filename,
            size: self.size,
            total_chunks: self.total_chunks,
            chunks: self.chunks,
        })
    }
}
