//! In-process backend with fault injection.
//!
//! Used for dry runs and by tests across the workspace. Failures are
//! scripted per [`Operation`]; stored blobs can be corrupted in place.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::{BackendFuture, StorageBackend, UploadReceipt};
use crate::error::BackendError;

const PATH_PREFIX: &str = "documents/";

/// Backend call kinds, for scripting failures and counting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Upload,
    Resolve,
    Download,
}

/// Stores blobs in a `HashMap` keyed by generated content handles.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    blobs: HashMap<String, Vec<u8>>,
    uploads: Vec<String>,
    next_message: u64,
    scripted: HashMap<Operation, VecDeque<BackendError>>,
    always: HashMap<Operation, BackendError>,
    calls: HashMap<Operation, u32>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next call of `op` with `err`. Queued failures are consumed
    /// in order.
    pub fn fail_next(&self, op: Operation, err: BackendError) {
        self.lock().scripted.entry(op).or_default().push_back(err);
    }

    /// Fails the next `count` calls of `op` with `status`.
    pub fn fail_next_with_status(&self, op: Operation, status: u16, count: usize) {
        for _ in 0..count {
            self.fail_next(
                op,
                BackendError::Status {
                    status,
                    body: format!("scripted {status}"),
                    retry_after: None,
                },
            );
        }
    }

    /// Fails every call of `op` with `status` until [`Self::clear_failures`].
    pub fn fail_always(&self, op: Operation, status: u16) {
        self.lock().always.insert(
            op,
            BackendError::Status {
                status,
                body: format!("persistent {status}"),
                retry_after: None,
            },
        );
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.scripted.clear();
        inner.always.clear();
    }

    /// Flips one bit of a stored blob. Returns `false` if the blob is
    /// unknown or shorter than `byte_index`.
    pub fn corrupt_blob(&self, file_ref: &str, byte_index: usize) -> bool {
        let mut inner = self.lock();
        match inner.blobs.get_mut(file_ref) {
            Some(blob) if byte_index < blob.len() => {
                blob[byte_index] ^= 0x01;
                true
            }
            _ => false,
        }
    }

    /// Returns a stored blob.
    pub fn blob(&self, file_ref: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(file_ref).cloned()
    }

    /// Filenames of successful uploads, in order.
    pub fn uploaded_names(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    /// Number of calls (successful or not) made for `op`.
    pub fn calls(&self, op: Operation) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Records a call and returns the failure to inject, if any.
    fn begin(&self, op: Operation) -> Result<(), BackendError> {
        let mut inner = self.lock();
        *inner.calls.entry(op).or_insert(0) += 1;
        match inner.scripted.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => inner.always.get(&op).cloned().map_or(Ok(()), Err),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn upload_document<'a>(
        &'a self,
        filename: &'a str,
        data: &'a [u8],
    ) -> BackendFuture<'a, UploadReceipt> {
        Box::pin(async move {
            self.begin(Operation::Upload)?;

            let mut inner = self.lock();
            inner.next_message += 1;
            let message_ref = inner.next_message.to_string();
            let file_ref = format!("mem-{message_ref}");
            inner.blobs.insert(file_ref.clone(), data.to_vec());
            inner.uploads.push(filename.to_string());
            Ok(UploadReceipt {
                message_ref,
                file_ref,
            })
        })
    }

    fn resolve_file<'a>(&'a self, file_ref: &'a str) -> BackendFuture<'a, String> {
        Box::pin(async move {
            self.begin(Operation::Resolve)?;

            if self.lock().blobs.contains_key(file_ref) {
                Ok(format!("{PATH_PREFIX}{file_ref}"))
            } else {
                Err(BackendError::Status {
                    status: 400,
                    body: format!("Bad Request: invalid file_id {file_ref}"),
                    retry_after: None,
                })
            }
        })
    }

    fn download<'a>(&'a self, path: &'a str) -> BackendFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.begin(Operation::Download)?;

            let file_ref = path.strip_prefix(PATH_PREFIX).unwrap_or(path);
            self.lock()
                .blobs
                .get(file_ref)
                .cloned()
                .ok_or_else(|| BackendError::Status {
                    status: 404,
                    body: format!("Not Found: {path}"),
                    retry_after: None,
                })
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_returns_blobs() {
        let backend = MemoryBackend::new();
        let receipt = backend.upload_document("a.part0000", b"abc").await.unwrap();
        assert_eq!(receipt.message_ref, "1");

        let path = backend.resolve_file(&receipt.file_ref).await.unwrap();
        assert_eq!(backend.download(&path).await.unwrap(), b"abc");
        assert_eq!(backend.uploaded_names(), vec!["a.part0000".to_string()]);
        assert_eq!(backend.calls(Operation::Upload), 1);
        assert_eq!(backend.calls(Operation::Download), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let backend = MemoryBackend::new();
        backend.fail_next_with_status(Operation::Upload, 429, 1);
        backend.fail_next_with_status(Operation::Upload, 502, 1);

        let first = backend.upload_document("x", b"1").await.unwrap_err();
        let second = backend.upload_document("x", b"1").await.unwrap_err();
        assert_eq!(first.status(), Some(429));
        assert_eq!(second.status(), Some(502));
        assert!(backend.upload_document("x", b"1").await.is_ok());
        assert_eq!(backend.calls(Operation::Upload), 3);
    }

    #[tokio::test]
    async fn persistent_failure_until_cleared() {
        let backend = MemoryBackend::new();
        backend.fail_always(Operation::Upload, 503);
        assert!(backend.upload_document("x", b"1").await.is_err());
        assert!(backend.upload_document("x", b"1").await.is_err());
        backend.clear_failures();
        assert!(backend.upload_document("x", b"1").await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_flips_one_bit() {
        let backend = MemoryBackend::new();
        let receipt = backend.upload_document("x", &[0u8; 4]).await.unwrap();
        assert!(backend.corrupt_blob(&receipt.file_ref, 2));
        assert_eq!(backend.blob(&receipt.file_ref).unwrap(), vec![0, 0, 1, 0]);
        assert!(!backend.corrupt_blob(&receipt.file_ref, 99));
        assert!(!backend.corrupt_blob("unknown", 0));
    }

    #[tokio::test]
    async fn unknown_ref_is_client_error() {
        let backend = MemoryBackend::new();
        let err = backend.resolve_file("nope").await.unwrap_err();
        assert_eq!(err.status(), Some(400));
    }
}
