//! # AES-256-GCM Encryption
//!
//! Authenticated encryption for shard envelopes. Every envelope the codec
//! produces, whether it sits in the device vault or travels sealed from a
//! collaborator, is an AES-256-GCM ciphertext with the envelope header bound
//! in as additional authenticated data.
//!
//! ## Nonce management
//!
//! Random 96-bit nonces from the OS CSPRNG. Keys here are either freshly
//! derived per envelope (scrypt with a fresh salt) or per-request transport
//! keys, so no key gets anywhere near the 2^48 birthday bound.
//!
//! ## Wire format
//!
//! `seal()` returns `nonce || ciphertext || tag` as a single `Vec<u8>`.
//! `open()` expects the same layout.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH};

/// Errors that can occur during encryption/decryption.
///
/// AES-GCM cannot tell a wrong key from a modified ciphertext. The shard codec
/// checks the key separately before calling [`open`], so by the time
/// `DecryptFailed` surfaces the key is known-good and the ciphertext is not.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- authentication tag mismatch")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {} bytes", AES_NONCE_LENGTH + AES_TAG_LENGTH)]
    CiphertextTooShort,
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
///
/// Returns `nonce || ciphertext || tag`.
///
/// ```
/// use trishard_wallet::crypto::encryption::{open, seal};
///
/// let key = [0x42u8; 32];
/// let sealed = seal(&key, b"shard bytes", b"header").unwrap();
/// let opened = open(&key, &sealed, b"header").unwrap();
/// assert_eq!(opened, b"shard bytes");
/// ```
pub fn seal(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data produced by [`seal`]. The `aad` must match byte for byte.
pub fn open(
    key: &[u8; AES_KEY_LENGTH],
    data: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if data.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let sealed = seal(&key, b"device shard", b"aad").unwrap();
        assert_eq!(open(&key, &sealed, b"aad").unwrap(), b"device shard");
    }

    #[test]
    fn test_sealed_length() {
        let key = test_key();
        let plaintext = b"exactly 26 bytes of input!";
        let sealed = seal(&key, plaintext, b"").unwrap();
        assert_eq!(
            sealed.len(),
            AES_NONCE_LENGTH + plaintext.len() + AES_TAG_LENGTH
        );
    }

    #[test]
    fn test_bit_flip_fails() {
        let key = test_key();
        let mut sealed = seal(&key, b"secret", b"aad").unwrap();
        sealed[AES_NONCE_LENGTH] ^= 0x01;
        assert!(matches!(
            open(&key, &sealed, b"aad"),
            Err(EncryptionError::DecryptFailed)
        ));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = test_key();
        let sealed = seal(&key, b"secret", b"role=device").unwrap();
        assert!(open(&key, &sealed, b"role=backup").is_err());
    }

    #[test]
    fn test_unique_nonces() {
        let key = test_key();
        let a = seal(&key, b"message", b"").unwrap();
        let b = seal(&key, b"message", b"").unwrap();
        assert_ne!(&a[..AES_NONCE_LENGTH], &b[..AES_NONCE_LENGTH]);
    }

    #[test]
    fn test_too_short_rejected() {
        let key = test_key();
        assert!(matches!(
            open(&key, &[0u8; 20], b""),
            Err(EncryptionError::CiphertextTooShort)
        ));
    }
}
