//! # Storage
//!
//! ```text
//! db.rs      : sled handle, named trees, bincode helpers
//! vault.rs   : Local Shard Vault (Device shard only, integrity-checked)
//! registry.rs: wallet records, backup state, recovery sessions, audit log
//! ```
//!
//! Everything is keyed by [`WalletKey`], the `(user_id, chain)` pair, so one
//! user may hold a wallet per chain without entries colliding.

pub mod db;
pub mod registry;
pub mod vault;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use db::{DbError, DbResult, WalletDb};
pub use registry::{AuditEntry, AuditEvent, WalletRecord, WalletRegistry, WalletStatus};
pub use vault::{DeviceShardStatus, LocalShardVault, VaultError};

/// Identifies one wallet: a user on a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletKey {
    pub user_id: String,
    pub chain: String,
}

impl WalletKey {
    /// Chains are case-insensitive tickers; stored uppercase.
    pub fn new(user_id: impl Into<String>, chain: impl AsRef<str>) -> Self {
        Self {
            user_id: user_id.into(),
            chain: chain.as_ref().trim().to_ascii_uppercase(),
        }
    }

    /// `len(user_id) (4B BE) || user_id || chain`. Unambiguous for any
    /// user id, including ones that contain separators.
    pub fn storage_key(&self) -> Vec<u8> {
        let user = self.user_id.as_bytes();
        let mut key = Vec::with_capacity(4 + user.len() + self.chain.len());
        key.extend_from_slice(&(user.len() as u32).to_be_bytes());
        key.extend_from_slice(user);
        key.extend_from_slice(self.chain.as_bytes());
        key
    }

    /// Prefix shared by every wallet of `user_id`.
    pub fn user_prefix(user_id: &str) -> Vec<u8> {
        let user = user_id.as_bytes();
        let mut prefix = Vec::with_capacity(4 + user.len());
        prefix.extend_from_slice(&(user.len() as u32).to_be_bytes());
        prefix.extend_from_slice(user);
        prefix
    }
}

impl fmt::Display for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.chain)
    }
}
