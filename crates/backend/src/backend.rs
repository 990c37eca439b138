//! Backend collaborator trait.

use std::future::Future;
use std::pin::Pin;

use crate::error::BackendError;

/// Boxed future returned by [`StorageBackend`] calls.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Acknowledgement of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Backend message/sequence reference. Informational.
    pub message_ref: String,
    /// Content handle needed to fetch the blob again.
    pub file_ref: String,
}

/// Abstract blob-capable backend.
///
/// Each method performs exactly one network attempt; retries, timeouts and
/// cancellation belong to [`crate::ResilientTransport`]. Using a trait keeps
/// chunk logic decoupled from the concrete service and testable with
/// in-memory implementations.
pub trait StorageBackend: Send + Sync {
    /// Uploads `data` as a document named `filename`.
    fn upload_document<'a>(
        &'a self,
        filename: &'a str,
        data: &'a [u8],
    ) -> BackendFuture<'a, UploadReceipt>;

    /// Resolves a content handle to a retrievable path.
    fn resolve_file<'a>(&'a self, file_ref: &'a str) -> BackendFuture<'a, String>;

    /// Downloads the raw bytes at `path`.
    fn download<'a>(&'a self, path: &'a str) -> BackendFuture<'a, Vec<u8>>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}
