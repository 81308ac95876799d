//! Crypto primitives
//!
//! Node identity generation, logical-key hashing, and the streaming
//! AES-256-CTR layer used when replicating blobs between peers.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{self, Read, Write};
use thiserror::Error;
use uuid::Uuid;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Size of the IV prefixed to every encrypted stream
pub const IV_SIZE: usize = 16;

/// Size of an encryption key
pub const KEY_SIZE: usize = 32;

const STREAM_BUF_SIZE: usize = 32 * 1024;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid key length: {0} (expected {KEY_SIZE})")]
    KeyLength(usize),

    #[error("stream ended before the {IV_SIZE}-byte IV")]
    TruncatedIv,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Generate a fresh, globally-unique node identifier (hyphenated hex).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Hash a logical key into the fixed-width hex digest used as the
/// metadata-index key. Stable across releases.
pub fn hash_key(key: &str) -> String {
    hex::encode(Md5::digest(key.as_bytes()))
}

/// Generate a random 32-byte encryption key.
pub fn new_encryption_key() -> Vec<u8> {
    let mut key = vec![0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

fn new_cipher(key: &[u8], iv: &[u8; IV_SIZE]) -> CryptoResult<Aes256Ctr> {
    let key: [u8; KEY_SIZE] = key
        .try_into()
        .map_err(|_| CryptoError::KeyLength(key.len()))?;
    Ok(Aes256Ctr::new(&key.into(), iv.into()))
}

fn copy_stream<R: Read, W: Write>(
    cipher: &mut Aes256Ctr,
    src: &mut R,
    dst: &mut W,
) -> CryptoResult<usize> {
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    // The IV is counted towards the total in both directions; the server's
    // size field on the wire depends on this.
    let mut total = IV_SIZE;

    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        total += n;
    }

    Ok(total)
}

/// Encrypt `src` into `dst`: a random 16-byte IV is written first, then the
/// CTR-encrypted payload. Never buffers the whole payload.
///
/// Returns the total bytes written, IV included (plaintext length + 16).
pub fn copy_encrypt<R: Read, W: Write>(
    key: &[u8],
    src: &mut R,
    dst: &mut W,
) -> CryptoResult<usize> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let mut cipher = new_cipher(key, &iv)?;

    dst.write_all(&iv)?;
    copy_stream(&mut cipher, src, dst)
}

/// Decrypt `src` into `dst`: the first 16 bytes of `src` are taken as the IV,
/// the remainder is CTR-decrypted.
///
/// Returns the total bytes read, IV included (ciphertext body length + 16).
pub fn copy_decrypt<R: Read, W: Write>(
    key: &[u8],
    src: &mut R,
    dst: &mut W,
) -> CryptoResult<usize> {
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CryptoError::TruncatedIv
        } else {
            CryptoError::Io(e)
        }
    })?;

    let mut cipher = new_cipher(key, &iv)?;
    copy_stream(&mut cipher, src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = new_encryption_key();
        let payload = b"my big data file here!";

        let mut ciphertext = Vec::new();
        let written = copy_encrypt(&key, &mut Cursor::new(&payload[..]), &mut ciphertext).unwrap();
        assert_eq!(written, payload.len() + IV_SIZE);
        assert_eq!(ciphertext.len(), payload.len() + IV_SIZE);
        assert_ne!(&ciphertext[IV_SIZE..], &payload[..]);

        let mut plaintext = Vec::new();
        let read = copy_decrypt(&key, &mut Cursor::new(&ciphertext), &mut plaintext).unwrap();
        assert_eq!(read, payload.len() + IV_SIZE);
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn test_ciphertext_length() {
        // 14-byte payload becomes 16-byte IV + 14 bytes of ciphertext
        let key = new_encryption_key();
        let mut out = Vec::new();
        copy_encrypt(&key, &mut Cursor::new(&b"fourteen bytes"[..]), &mut out).unwrap();
        assert_eq!(out.len(), 30);
    }

    #[test]
    fn test_invalid_key_length() {
        let mut out = Vec::new();
        let err = copy_encrypt(&[0u8; 16], &mut Cursor::new(&b"x"[..]), &mut out).unwrap_err();
        assert!(matches!(err, CryptoError::KeyLength(16)));
    }

    #[test]
    fn test_truncated_iv() {
        let key = new_encryption_key();
        let mut out = Vec::new();
        let err = copy_decrypt(&key, &mut Cursor::new(&[0u8; 7][..]), &mut out).unwrap_err();
        assert!(matches!(err, CryptoError::TruncatedIv));
    }

    #[test]
    fn test_hash_key_stable() {
        assert_eq!(hash_key("picture_1.png"), "75c2e31f7d5468c0ea90b6e5aae3ccfd");
        assert_eq!(hash_key("picture_1.png").len(), 32);
    }

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
