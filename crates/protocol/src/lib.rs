pub mod constants;
pub mod types;

// Re-export primary types for convenience.
pub use types::{
    ChunkDescriptor, FileId, TransferDirection, TransferProgress, TransferState, UploadedFile,
};
