//! # Local Shard Vault
//!
//! Durable home of the Device shard (A). At most one envelope per wallet;
//! `store` overwrites.
//!
//! Each entry is framed as `version (1B) || BLAKE3 digest (32B) || bincode`.
//! The outer digest lets [`LocalShardVault::load`] and
//! [`LocalShardVault::inspect`] tell "nothing stored" apart from "stored but
//! damaged" without needing the user's credential. Damage inside the
//! envelope itself is caught later by the codec.

use sled::Tree;
use thiserror::Error;
use tracing::{debug, error};

use super::db::{self, DbError, WalletDb};
use super::WalletKey;
use crate::crypto::hash;
use crate::shard::{ShardEnvelope, ShardRole};

const VAULT_ENTRY_VERSION: u8 = 1;
const HEADER_LENGTH: usize = 1 + 32;

#[derive(Debug, Error)]
pub enum VaultError {
    /// An entry exists but cannot be read back.
    #[error("vault entry for {key} is corrupted: {reason}")]
    Corrupted { key: String, reason: &'static str },

    /// Only Device envelopes belong in the vault.
    #[error("refusing to vault a {0} shard")]
    WrongRole(ShardRole),

    #[error("storage error: {0}")]
    Db(#[from] DbError),
}

impl From<sled::Error> for VaultError {
    fn from(e: sled::Error) -> Self {
        VaultError::Db(DbError::Sled(e))
    }
}

/// Device shard presence as seen without a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceShardStatus {
    Absent,
    Present,
    /// Present on disk but fails integrity checks. Remediation is recovery.
    Unreadable,
}

#[derive(Debug, Clone)]
pub struct LocalShardVault {
    tree: Tree,
}

impl LocalShardVault {
    pub fn new(db: &WalletDb) -> Self {
        Self {
            tree: db.device_shards().clone(),
        }
    }

    /// Store the Device envelope for `key`, replacing any previous one.
    pub fn store(&self, key: &WalletKey, envelope: &ShardEnvelope) -> Result<(), VaultError> {
        if envelope.role != ShardRole::Device {
            return Err(VaultError::WrongRole(envelope.role));
        }
        let body = db::encode(envelope)?;
        let digest = hash::record_digest(&body);

        let mut entry = Vec::with_capacity(HEADER_LENGTH + body.len());
        entry.push(VAULT_ENTRY_VERSION);
        entry.extend_from_slice(&digest);
        entry.extend_from_slice(&body);

        self.tree.insert(key.storage_key(), entry)?;
        self.tree.flush()?;
        debug!(wallet = %key, "device shard stored");
        Ok(())
    }

    /// `Ok(None)` when nothing is stored, `Err(Corrupted)` when something is
    /// stored but unreadable.
    pub fn load(&self, key: &WalletKey) -> Result<Option<ShardEnvelope>, VaultError> {
        let Some(raw) = self.tree.get(key.storage_key())? else {
            return Ok(None);
        };
        match parse_entry(&raw) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(reason) => {
                error!(wallet = %key, reason, "device shard entry failed integrity check");
                Err(VaultError::Corrupted {
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }

    /// Remove the Device shard. Returns whether anything was removed.
    pub fn remove(&self, key: &WalletKey) -> Result<bool, VaultError> {
        let removed = self.tree.remove(key.storage_key())?.is_some();
        self.tree.flush()?;
        if removed {
            debug!(wallet = %key, "device shard removed");
        }
        Ok(removed)
    }

    pub fn inspect(&self, key: &WalletKey) -> Result<DeviceShardStatus, VaultError> {
        match self.load(key) {
            Ok(Some(_)) => Ok(DeviceShardStatus::Present),
            Ok(None) => Ok(DeviceShardStatus::Absent),
            Err(VaultError::Corrupted { .. }) => Ok(DeviceShardStatus::Unreadable),
            Err(e) => Err(e),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

fn parse_entry(raw: &[u8]) -> Result<ShardEnvelope, &'static str> {
    if raw.len() <= HEADER_LENGTH {
        return Err("entry truncated");
    }
    if raw[0] != VAULT_ENTRY_VERSION {
        return Err("unknown entry version");
    }
    let stored: [u8; 32] = raw[1..HEADER_LENGTH]
        .try_into()
        .map_err(|_| "entry truncated")?;
    let body = &raw[HEADER_LENGTH..];
    if !hash::digest_eq(&hash::record_digest(body), &stored) {
        return Err("digest mismatch");
    }
    let envelope: ShardEnvelope = db::decode(body).map_err(|_| "undecodable envelope")?;
    if envelope.role != ShardRole::Device {
        return Err("entry holds a non-device shard");
    }
    Ok(envelope)
}
