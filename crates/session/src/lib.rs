//! Transfer session manager.
//!
//! Tracks many uploads and downloads at once, runs at most
//! `max_concurrent_transfers` of them, and lets callers pause, resume,
//! cancel, retry and remove individual transfers. Chunk work is delegated
//! to a [`ChunkEngine`]; the manager itself never touches the backend.
//!
//! # Lifecycle
//!
//! ```text
//! pending -> active -> completed
//!              |  \--> error --(retry)--> pending
//!              |   \-> cancelled
//!              \-> paused --(resume)--> pending
//! ```

pub mod engine;
pub mod error;
pub mod manager;
pub mod types;

mod worker;

pub use engine::{ChunkEngine, EngineFuture};
pub use error::SessionError;
pub use manager::TransferManager;
pub use types::{
    FailureKind, ManagerConfig, TransferEvent, TransferFailure, TransferId, TransferOutput,
    TransferRecord,
};
