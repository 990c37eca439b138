use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::Rng;

use crate::{ChunkKey, CryptoError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Length of the random IV prefixed to every sealed blob.
pub const IV_LEN: usize = 16;

const BLOCK_LEN: usize = 16;

/// Encrypts `plaintext` with AES-256-CBC (PKCS#7) under a fresh random IV.
///
/// Returns `IV || ciphertext`.
pub fn encrypt(plaintext: &[u8], key: &ChunkKey) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(&key.0.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut sealed = Vec::with_capacity(IV_LEN + ciphertext.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    sealed
}

/// Decrypts a blob produced by [`encrypt`].
///
/// Fails on truncated input, misaligned ciphertext, or a padding check
/// failure (wrong key or corrupted bytes).
pub fn decrypt(sealed: &[u8], key: &ChunkKey) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < IV_LEN + BLOCK_LEN {
        return Err(CryptoError::Decryption(format!(
            "sealed chunk too short: {} bytes",
            sealed.len()
        )));
    }
    let (iv, ciphertext) = sealed.split_at(IV_LEN);
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::Decryption(format!(
            "ciphertext length {} is not a multiple of the block size",
            ciphertext.len()
        )));
    }
    let iv: [u8; IV_LEN] = iv
        .try_into()
        .map_err(|_| CryptoError::Decryption("malformed IV".into()))?;

    Aes256CbcDec::new(&key.0.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decryption("padding check failed".into()))
}
