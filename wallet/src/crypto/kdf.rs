//! Passphrase key derivation.
//!
//! scrypt turns a user passphrase into an AES-256 key. The salt and cost
//! parameters travel with the envelope in its encryption context; the derived
//! key never does.

use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{KdfParams, AES_KEY_LENGTH, KDF_SALT_LENGTH};

#[derive(Debug, Error)]
pub enum KdfError {
    #[error("invalid scrypt parameters (log_n={log_n}, r={r}, p={p})")]
    InvalidParams { log_n: u8, r: u32, p: u32 },

    #[error("key derivation failed")]
    DerivationFailed,
}

/// Fresh random salt for a new envelope.
pub fn generate_salt() -> [u8; KDF_SALT_LENGTH] {
    let mut salt = [0u8; KDF_SALT_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte key from `passphrase` and `salt`.
///
/// The output is wrapped in [`Zeroizing`] so it is wiped when the caller
/// drops it.
pub fn derive_key(
    passphrase: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, KdfError> {
    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, AES_KEY_LENGTH)
        .map_err(|_| KdfError::InvalidParams {
            log_n: params.log_n,
            r: params.r,
            p: params.p,
        })?;

    let mut key = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    scrypt::scrypt(passphrase, salt, &scrypt_params, &mut *key)
        .map_err(|_| KdfError::DerivationFailed)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let params = KdfParams::insecure_fast();
        let salt = [7u8; KDF_SALT_LENGTH];
        let a = derive_key(b"correct horse", &salt, &params).unwrap();
        let b = derive_key(b"correct horse", &salt, &params).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_salt_changes_key() {
        let params = KdfParams::insecure_fast();
        let a = derive_key(b"pw", &[1u8; KDF_SALT_LENGTH], &params).unwrap();
        let b = derive_key(b"pw", &[2u8; KDF_SALT_LENGTH], &params).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            log_n: 0,
            r: 0,
            p: 0,
        };
        assert!(matches!(
            derive_key(b"pw", &[0u8; KDF_SALT_LENGTH], &params),
            Err(KdfError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
