use std::fmt;

use relaybox_protocol::FileId;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::CryptoError;

/// Minimum accepted server secret length in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Process-wide secret mixed into every chunk key.
///
/// Read-only once constructed; not rotated within a process.
pub struct ServerSecret(Vec<u8>);

impl ServerSecret {
    /// Wraps raw secret bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() < MIN_SECRET_LEN {
            return Err(CryptoError::InvalidSecret(format!(
                "secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Parses a configured secret.
    ///
    /// A string of hex digits (even length) is decoded; anything else is
    /// used as raw UTF-8 bytes.
    pub fn parse(value: &str) -> Result<Self, CryptoError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(CryptoError::InvalidSecret("secret is empty".into()));
        }
        match hex::decode(trimmed) {
            Ok(bytes) => Self::new(bytes),
            Err(_) => Self::new(trimmed.as_bytes().to_vec()),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerSecret(<{} bytes>)", self.0.len())
    }
}

impl Drop for ServerSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// AES-256 key for a single chunk. Wiped on drop.
pub struct ChunkKey(pub(crate) [u8; 32]);

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChunkKey(..)")
    }
}

impl Drop for ChunkKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Derives the key for `chunk_index` of `file_id`.
///
/// SHA-256 over `file_id || decimal(chunk_index) || secret`. Same inputs
/// always give the same key.
pub fn derive_chunk_key(file_id: &FileId, chunk_index: u32, secret: &ServerSecret) -> ChunkKey {
    let mut hasher = Sha256::new();
    hasher.update(file_id.as_str().as_bytes());
    hasher.update(chunk_index.to_string().as_bytes());
    hasher.update(secret.as_bytes());
    ChunkKey(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> ServerSecret {
        ServerSecret::new(b"0123456789abcdef-test-secret".to_vec()).unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let id = FileId::from("file-1");
        let a = derive_chunk_key(&id, 3, &secret());
        let b = derive_chunk_key(&id, 3, &secret());
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn keys_differ_per_chunk_and_file() {
        let s = secret();
        let id = FileId::from("file-1");
        let k0 = derive_chunk_key(&id, 0, &s);
        let k1 = derive_chunk_key(&id, 1, &s);
        let other = derive_chunk_key(&FileId::from("file-2"), 0, &s);
        assert_ne!(k0.0, k1.0);
        assert_ne!(k0.0, other.0);
    }

    #[test]
    fn keys_differ_per_secret() {
        let id = FileId::from("file-1");
        let other = ServerSecret::new(b"another-secret-of-length".to_vec()).unwrap();
        assert_ne!(
            derive_chunk_key(&id, 0, &secret()).0,
            derive_chunk_key(&id, 0, &other).0
        );
    }

    #[test]
    fn short_secret_rejected() {
        assert!(matches!(
            ServerSecret::new(b"short".to_vec()),
            Err(CryptoError::InvalidSecret(_))
        ));
        assert!(ServerSecret::parse("   ").is_err());
    }

    #[test]
    fn parse_hex_and_raw() {
        let hex_secret = ServerSecret::parse("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(hex_secret.as_bytes().len(), 16);

        let raw = ServerSecret::parse("not hex but long enough").unwrap();
        assert_eq!(raw.as_bytes(), b"not hex but long enough");
    }

    #[test]
    fn debug_is_redacted() {
        let s = secret();
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("0123456789"));
        assert_eq!(format!("{:?}", derive_chunk_key(&FileId::from("f"), 0, &s)), "ChunkKey(..)");
    }
}
