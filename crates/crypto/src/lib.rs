//! Crypto unit for chunk payloads.
//!
//! Keys are never stored: every chunk key is recomputed from the file id,
//! the chunk index and the process-wide [`ServerSecret`]. Sealed blobs carry
//! their own random IV, and integrity hashes are always taken over the
//! sealed bytes.

mod checksum;
mod cipher;
mod key;

pub use checksum::checksum_bytes;
pub use cipher::{IV_LEN, decrypt, encrypt};
pub use key::{ChunkKey, MIN_SECRET_LEN, ServerSecret, derive_chunk_key};

/// Errors produced by the crypto unit.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid server secret: {0}")]
    InvalidSecret(String),
}
