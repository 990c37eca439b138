//! Storage backend collaborator and the resilient transport wrapped around it.
//!
//! A messaging platform is used as dumb blob storage. The backend surface is
//! kept to three calls so any blob-capable service can be substituted:
//!
//! 1. **Upload**: multipart binary upload returning message/content refs
//! 2. **Resolve**: content ref to a retrievable path
//! 3. **Download**: raw bytes by path
//!
//! Every call goes through [`ResilientTransport`], which adds per-attempt
//! timeouts, retry with exponential backoff, Retry-After honoring and
//! cancellation.

pub mod backend;
pub mod error;
pub mod http;
pub mod memory;
pub mod transport;

// Re-export primary types for convenience.
pub use backend::{BackendFuture, StorageBackend, UploadReceipt};
pub use error::{BackendError, TransportError};
pub use http::{HttpBackend, HttpConfig};
pub use memory::{MemoryBackend, Operation};
pub use transport::{CallKind, ResilientTransport, TransportConfig};
