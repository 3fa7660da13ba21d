//! # Wallet Keys & Addresses
//!
//! The reference collaborators derive wallets from a 32-byte Ed25519 seed.
//! The address is the last 20 bytes of the BLAKE3 hash of the public key,
//! rendered as `0x` + 40 lowercase hex characters.
//!
//! This crate never holds a full seed outside the in-process collaborator.
//! The lifecycle manager itself only ever compares addresses.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

use crate::config::{ADDRESS_LENGTH, SIGNING_SEED_LENGTH};

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address must start with 0x")]
    MissingPrefix,

    #[error("address body must be {expected} hex characters, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("address contains non-hex characters")]
    NotHex,
}

/// Ed25519 signing key reconstructed from a seed.
///
/// Deliberately not `Clone`, `Debug` or `Serialize`. `SigningKey` wipes
/// itself on drop.
pub struct WalletKeypair {
    signing_key: SigningKey,
}

impl WalletKeypair {
    pub fn from_seed(seed: &[u8; SIGNING_SEED_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn address(&self) -> String {
        derive_address(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Address for an Ed25519 public key.
pub fn derive_address(public_key: &[u8; 32]) -> String {
    let digest = blake3::hash(public_key);
    let body = &digest.as_bytes()[32 - ADDRESS_LENGTH..];
    format!("0x{}", hex::encode(body))
}

/// Normalize an address to lowercase after validating its shape.
pub fn normalize_address(address: &str) -> Result<String, AddressError> {
    let body = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .ok_or(AddressError::MissingPrefix)?;
    if body.len() != ADDRESS_LENGTH * 2 {
        return Err(AddressError::WrongLength {
            expected: ADDRESS_LENGTH * 2,
            got: body.len(),
        });
    }
    if !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressError::NotHex);
    }
    Ok(format!("0x{}", body.to_ascii_lowercase()))
}

/// Verify a signature produced by [`WalletKeypair::sign`].
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}
