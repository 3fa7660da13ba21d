//! # Shard Codec
//!
//! Encrypts, decrypts and text-encodes individual shards. Leaf module: no I/O,
//! no locks, no async.
//!
//! ## Envelope layout
//!
//! ```text
//! checksum   = BLAKE3-dk("shard checksum", share_index || share)
//! key        = scrypt(passphrase, salt, params) | raw 32-byte key
//! key_check  = BLAKE3-dk("envelope key check", key)
//! aad        = version || role_index || checksum
//! ciphertext = AES-256-GCM(key, share_index || share, aad)
//! ```
//!
//! ## Error classes
//!
//! Callers react differently to a wrong credential (reprompt) and to damaged
//! data (recover from the other shards), so decryption keeps them apart:
//!
//! 1. Key-check mismatch → [`CodecError::WrongCredential`].
//! 2. Key checks out but the tag does not verify → [`CodecError::Corrupted`].
//! 3. Tag verifies but framing or checksum disagree → [`CodecError::Corrupted`].
//!
//! ## Recovery codes
//!
//! Shard C is shown to the user as a Bech32m string with the `tsc` prefix.
//! The payload is `version || role_index || share || checksum[..4]`.
//! Bech32m catches typos; the inner checksum catches a payload that was
//! altered and re-encoded. Neither ties a code to a wallet or a backup
//! generation: a superseded code still decodes, and is only refused when
//! the reconstructed address does not match the wallet.

use bech32::{Bech32m, Hrp};
use thiserror::Error;
use zeroize::Zeroizing;

use super::{EncryptionContext, KeyDerivation, ShardEnvelope, ShardKey, ShardRole, ShardSecret};
use crate::config::{
    KdfParams, AES_KEY_LENGTH, ENVELOPE_FORMAT_VERSION, RECOVERY_CODE_CHECKSUM_LENGTH,
    RECOVERY_CODE_HRP,
};
use crate::crypto::encryption::{self, EncryptionError};
use crate::crypto::hash;
use crate::crypto::kdf::{self, KdfError};

#[derive(Debug, Error)]
pub enum CodecError {
    /// The passphrase or device key does not open this envelope.
    #[error("wrong passphrase or device key")]
    WrongCredential,

    /// Passphrase given for a raw-key envelope, or the other way round.
    #[error("envelope expects a {expected} key")]
    KeyKindMismatch { expected: &'static str },

    /// The envelope decrypted under a correct key but its contents are damaged.
    #[error("shard envelope is corrupted: {0}")]
    Corrupted(&'static str),

    #[error("unsupported envelope format version {0}")]
    UnsupportedVersion(u8),

    /// A recovery code failed to parse or its checksum is wrong.
    #[error("invalid recovery code: {0}")]
    InvalidCode(String),

    #[error("key derivation failed: {0}")]
    Kdf(#[from] KdfError),

    #[error("encryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

impl CodecError {
    /// Integrity failures route to recovery, not to a reprompt.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CodecError::Corrupted(_) | CodecError::UnsupportedVersion(_)
        )
    }

    /// Credential failures route to a reprompt.
    pub fn is_wrong_credential(&self) -> bool {
        matches!(
            self,
            CodecError::WrongCredential | CodecError::KeyKindMismatch { .. }
        )
    }
}

fn aad_for(version: u8, role: ShardRole, checksum: &[u8; 32]) -> [u8; 34] {
    let mut aad = [0u8; 34];
    aad[0] = version;
    aad[1] = role.share_index();
    aad[2..].copy_from_slice(checksum);
    aad
}

fn key_for(
    key: ShardKey<'_>,
    derivation: &KeyDerivation,
) -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, CodecError> {
    match (key, derivation) {
        (ShardKey::Passphrase(passphrase), KeyDerivation::Scrypt { salt, params }) => {
            Ok(kdf::derive_key(passphrase, salt, params)?)
        }
        (ShardKey::Raw(raw), KeyDerivation::Raw) => Ok(Zeroizing::new(*raw)),
        (_, KeyDerivation::Scrypt { .. }) => Err(CodecError::KeyKindMismatch {
            expected: "passphrase",
        }),
        (_, KeyDerivation::Raw) => Err(CodecError::KeyKindMismatch { expected: "raw" }),
    }
}

/// Encrypt a shard under a passphrase or raw key.
pub fn encrypt_shard(
    secret: &ShardSecret,
    key: ShardKey<'_>,
    kdf_params: &KdfParams,
) -> Result<ShardEnvelope, CodecError> {
    let derivation = match key {
        ShardKey::Passphrase(_) => KeyDerivation::Scrypt {
            salt: kdf::generate_salt(),
            params: *kdf_params,
        },
        ShardKey::Raw(_) => KeyDerivation::Raw,
    };
    let envelope_key = key_for(key, &derivation)?;

    let plaintext = secret.to_plaintext();
    let checksum = hash::shard_checksum(&plaintext);
    let aad = aad_for(ENVELOPE_FORMAT_VERSION, secret.role(), &checksum);
    let ciphertext = encryption::seal(&envelope_key, &plaintext, &aad)?;

    Ok(ShardEnvelope {
        version: ENVELOPE_FORMAT_VERSION,
        role: secret.role(),
        ciphertext,
        context: EncryptionContext {
            derivation,
            key_check: hash::key_check(&envelope_key),
        },
        checksum,
    })
}

/// Decrypt a shard envelope, verifying its checksum before returning.
pub fn decrypt_shard(envelope: &ShardEnvelope, key: ShardKey<'_>) -> Result<ShardSecret, CodecError> {
    if envelope.version != ENVELOPE_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.version));
    }

    let envelope_key = key_for(key, &envelope.context.derivation)?;
    if !hash::digest_eq(&hash::key_check(&envelope_key), &envelope.context.key_check) {
        return Err(CodecError::WrongCredential);
    }

    let aad = aad_for(envelope.version, envelope.role, &envelope.checksum);
    let plaintext = Zeroizing::new(
        encryption::open(&envelope_key, &envelope.ciphertext, &aad)
            .map_err(|_| CodecError::Corrupted("ciphertext failed authentication"))?,
    );

    if !hash::digest_eq(&hash::shard_checksum(&plaintext), &envelope.checksum) {
        return Err(CodecError::Corrupted("checksum mismatch"));
    }

    ShardSecret::from_plaintext(envelope.role, &plaintext)
        .ok_or(CodecError::Corrupted("shard framing does not match role"))
}

/// Re-encrypt under a new credential (credential change). The plaintext is
/// wiped before this returns.
pub fn reencrypt_shard(
    envelope: &ShardEnvelope,
    old_key: ShardKey<'_>,
    new_key: ShardKey<'_>,
    kdf_params: &KdfParams,
) -> Result<ShardEnvelope, CodecError> {
    let secret = decrypt_shard(envelope, old_key)?;
    let result = encrypt_shard(&secret, new_key, kdf_params);
    secret.wipe();
    result
}

/// Hex(bincode) form used when envelopes travel inside JSON bodies.
pub fn envelope_to_wire(envelope: &ShardEnvelope) -> Result<String, CodecError> {
    bincode::serialize(envelope)
        .map(hex::encode)
        .map_err(|e| CodecError::Serialization(e.to_string()))
}

pub fn envelope_from_wire(wire: &str) -> Result<ShardEnvelope, CodecError> {
    let bytes = hex::decode(wire.trim()).map_err(|e| CodecError::Serialization(e.to_string()))?;
    bincode::deserialize(&bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Recovery codes
// ---------------------------------------------------------------------------

/// Render a shard as a Bech32m recovery code.
pub fn encode_recovery_code(secret: &ShardSecret) -> Result<Zeroizing<String>, CodecError> {
    let hrp = Hrp::parse(RECOVERY_CODE_HRP).map_err(|e| CodecError::InvalidCode(e.to_string()))?;

    let mut payload = Zeroizing::new(Vec::with_capacity(
        2 + secret.len() + RECOVERY_CODE_CHECKSUM_LENGTH,
    ));
    payload.push(ENVELOPE_FORMAT_VERSION);
    payload.extend_from_slice(&secret.to_plaintext());
    let checksum = hash::code_checksum(&payload);
    payload.extend_from_slice(&checksum[..RECOVERY_CODE_CHECKSUM_LENGTH]);

    bech32::encode::<Bech32m>(hrp, &payload)
        .map(Zeroizing::new)
        .map_err(|e| CodecError::InvalidCode(e.to_string()))
}

/// Parse a recovery code typed or pasted by the user.
///
/// Whitespace and `-` separators are ignored and case is folded, so codes
/// survive being copied off paper in groups.
pub fn decode_recovery_code(code: &str) -> Result<ShardSecret, CodecError> {
    let cleaned: Zeroizing<String> = Zeroizing::new(
        code.chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase(),
    );

    let (hrp, data) =
        bech32::decode(&cleaned).map_err(|e| CodecError::InvalidCode(e.to_string()))?;
    let data = Zeroizing::new(data);
    if hrp.as_str() != RECOVERY_CODE_HRP {
        return Err(CodecError::InvalidCode(format!(
            "unexpected prefix {}",
            hrp.as_str()
        )));
    }
    if data.len() < 3 + RECOVERY_CODE_CHECKSUM_LENGTH {
        return Err(CodecError::InvalidCode("code too short".into()));
    }

    let (body, tail) = data.split_at(data.len() - RECOVERY_CODE_CHECKSUM_LENGTH);
    let expected = hash::code_checksum(body);
    if expected[..RECOVERY_CODE_CHECKSUM_LENGTH] != *tail {
        return Err(CodecError::InvalidCode("checksum mismatch".into()));
    }
    if body[0] != ENVELOPE_FORMAT_VERSION {
        return Err(CodecError::InvalidCode(format!(
            "unsupported code version {}",
            body[0]
        )));
    }

    let role = ShardRole::from_share_index(body[1])
        .ok_or_else(|| CodecError::InvalidCode("unknown shard role".into()))?;
    ShardSecret::from_plaintext(role, &body[1..])
        .ok_or_else(|| CodecError::InvalidCode("empty shard".into()))
}
