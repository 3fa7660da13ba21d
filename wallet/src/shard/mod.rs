//! # Shards
//!
//! A wallet's signing seed is split 2-of-3. Each piece has a fixed
//! [`ShardRole`] that never changes after issuance:
//!
//! | Role             | Shard | Lives                                  |
//! |------------------|-------|----------------------------------------|
//! | `Device`         | A     | local shard vault, encrypted           |
//! | `ServerAssisted` | B     | behind the provisioning service        |
//! | `BackupOwner`    | C     | with the user, shown once, never kept  |
//!
//! Plaintext shard material only ever exists inside a [`ShardSecret`], which
//! wipes itself on drop and redacts itself in `Debug` output. Everything at
//! rest or on the wire is a [`ShardEnvelope`].

pub mod codec;
pub mod sharing;

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::{KdfParams, AES_KEY_LENGTH, HASH_OUTPUT_LENGTH, KDF_SALT_LENGTH};

pub use codec::{
    decode_recovery_code, decrypt_shard, encode_recovery_code, encrypt_shard, reencrypt_shard,
    CodecError,
};
pub use sharing::{combine_shards, derive_share, split_seed, SharingError};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Which of the three shards this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRole {
    Device,
    ServerAssisted,
    BackupOwner,
}

impl ShardRole {
    pub const ALL: [ShardRole; 3] = [
        ShardRole::Device,
        ShardRole::ServerAssisted,
        ShardRole::BackupOwner,
    ];

    /// Evaluation point of this role's share (x-coordinate, 1-based).
    pub fn share_index(self) -> u8 {
        match self {
            ShardRole::Device => 1,
            ShardRole::ServerAssisted => 2,
            ShardRole::BackupOwner => 3,
        }
    }

    pub fn from_share_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(ShardRole::Device),
            2 => Some(ShardRole::ServerAssisted),
            3 => Some(ShardRole::BackupOwner),
            _ => None,
        }
    }

    /// Letter used in user-facing copy ("shard A").
    pub fn letter(self) -> char {
        match self {
            ShardRole::Device => 'A',
            ShardRole::ServerAssisted => 'B',
            ShardRole::BackupOwner => 'C',
        }
    }
}

impl fmt::Display for ShardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardRole::Device => "device",
            ShardRole::ServerAssisted => "server_assisted",
            ShardRole::BackupOwner => "backup_owner",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Plaintext shard material
// ---------------------------------------------------------------------------

/// Plaintext share bytes for one role.
///
/// Not `Clone`: a copy of shard material is a second thing to wipe. Wiped on
/// drop; call [`ShardSecret::wipe`] to make the point of destruction explicit
/// at the call site.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ShardSecret {
    #[zeroize(skip)]
    role: ShardRole,
    share: Vec<u8>,
}

impl ShardSecret {
    pub fn new(role: ShardRole, share: Vec<u8>) -> Self {
        Self { role, share }
    }

    pub fn role(&self) -> ShardRole {
        self.role
    }

    /// Raw share bytes (y-values). Keep the borrow short.
    pub fn expose(&self) -> &[u8] {
        &self.share
    }

    pub fn len(&self) -> usize {
        self.share.len()
    }

    pub fn is_empty(&self) -> bool {
        self.share.is_empty()
    }

    /// Framed plaintext: `share_index || share`.
    pub(crate) fn to_plaintext(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(1 + self.share.len()));
        out.push(self.role.share_index());
        out.extend_from_slice(&self.share);
        out
    }

    /// Parse framed plaintext, checking it belongs to `role`.
    pub(crate) fn from_plaintext(role: ShardRole, plaintext: &[u8]) -> Option<Self> {
        let (&index, share) = plaintext.split_first()?;
        if index != role.share_index() || share.is_empty() {
            return None;
        }
        Some(Self::new(role, share.to_vec()))
    }

    /// Overwrite the share bytes now.
    pub fn wipe(mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for ShardSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardSecret")
            .field("role", &self.role)
            .field("length", &self.share.len())
            .field("share", &"***SENSITIVE***")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// How the envelope key was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyDerivation {
    /// scrypt over a user passphrase.
    Scrypt {
        salt: [u8; KDF_SALT_LENGTH],
        params: KdfParams,
    },
    /// A 32-byte key used as-is (device key or transport key).
    Raw,
}

/// Parameters needed to decrypt an envelope. Never the key itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub derivation: KeyDerivation,
    /// BLAKE3 key-check value of the envelope key.
    pub key_check: [u8; HASH_OUTPUT_LENGTH],
}

/// One encrypted shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEnvelope {
    pub version: u8,
    pub role: ShardRole,
    /// `nonce || ciphertext || tag`.
    pub ciphertext: Vec<u8>,
    pub context: EncryptionContext,
    /// Checksum of the framed plaintext shard.
    pub checksum: [u8; HASH_OUTPUT_LENGTH],
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Borrowed key material handed to the codec.
#[derive(Clone, Copy)]
pub enum ShardKey<'a> {
    Passphrase(&'a [u8]),
    Raw(&'a [u8; AES_KEY_LENGTH]),
}

/// Owned device credential protecting the local Device shard.
pub enum DeviceCredential {
    Passphrase(Zeroizing<String>),
    DeviceKey(Zeroizing<[u8; AES_KEY_LENGTH]>),
}

impl DeviceCredential {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        DeviceCredential::Passphrase(Zeroizing::new(passphrase.into()))
    }

    pub fn device_key(key: [u8; AES_KEY_LENGTH]) -> Self {
        DeviceCredential::DeviceKey(Zeroizing::new(key))
    }

    pub fn as_key(&self) -> ShardKey<'_> {
        match self {
            DeviceCredential::Passphrase(p) => ShardKey::Passphrase(p.as_bytes()),
            DeviceCredential::DeviceKey(k) => ShardKey::Raw(k),
        }
    }
}

impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCredential::Passphrase(_) => f.write_str("DeviceCredential::Passphrase(***)"),
            DeviceCredential::DeviceKey(_) => f.write_str("DeviceCredential::DeviceKey(***)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_indices_roundtrip() {
        for role in ShardRole::ALL {
            assert_eq!(ShardRole::from_share_index(role.share_index()), Some(role));
        }
        assert_eq!(ShardRole::from_share_index(0), None);
        assert_eq!(ShardRole::from_share_index(4), None);
    }

    #[test]
    fn test_debug_redacts_share() {
        let secret = ShardSecret::new(ShardRole::Device, vec![0xAA; 32]);
        let rendered = format!("{:?}", secret);
        assert!(rendered.contains("SENSITIVE"));
        assert!(!rendered.contains("170"));
    }

    #[test]
    fn test_plaintext_framing_checks_role() {
        let secret = ShardSecret::new(ShardRole::BackupOwner, vec![1, 2, 3]);
        let framed = secret.to_plaintext();
        assert_eq!(framed[0], 3);
        assert!(ShardSecret::from_plaintext(ShardRole::BackupOwner, &framed).is_some());
        assert!(ShardSecret::from_plaintext(ShardRole::Device, &framed).is_none());
        assert!(ShardSecret::from_plaintext(ShardRole::BackupOwner, &[3]).is_none());
    }

    #[test]
    fn test_credential_debug_redacts() {
        let cred = DeviceCredential::passphrase("hunter2");
        assert!(!format!("{:?}", cred).contains("hunter2"));
    }

    #[test]
    fn test_role_serializes_snake_case() {
        let json = serde_json::to_string(&ShardRole::ServerAssisted).unwrap();
        assert_eq!(json, "\"server_assisted\"");
    }
}
