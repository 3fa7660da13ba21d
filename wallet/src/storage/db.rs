//! # WalletDb: Persistent Store
//!
//! sled-backed persistence for everything the lifecycle manager must survive
//! a restart with. Each concern gets its own named tree:
//!
//! | Tree                | Key                       | Value                      |
//! |---------------------|---------------------------|----------------------------|
//! | `device_shards`     | wallet key                | versioned vault entry      |
//! | `wallets`           | wallet key                | `bincode(WalletRecord)`    |
//! | `backups`           | wallet key                | `bincode(BackupRecord)`    |
//! | `recovery_sessions` | session id (UTF-8)        | `bincode(RecoverySession)` |
//! | `audit`             | sequence id (8B BE)       | `bincode(AuditEntry)`      |
//!
//! Wallet keys are length-prefixed `(user_id, chain)` pairs, see
//! [`WalletKey::storage_key`](super::WalletKey::storage_key). Audit ids come
//! from sled's monotonic id generator and are stored big-endian so that
//! iteration order is insertion order.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

pub(crate) const TREE_DEVICE_SHARDS: &str = "device_shards";
pub(crate) const TREE_WALLETS: &str = "wallets";
pub(crate) const TREE_BACKUPS: &str = "backups";
pub(crate) const TREE_RECOVERY_SESSIONS: &str = "recovery_sessions";
pub(crate) const TREE_AUDIT: &str = "audit";

/// Handle to the on-disk store. Cheap to clone; sled trees are internally
/// reference counted and safe for concurrent use.
#[derive(Debug, Clone)]
pub struct WalletDb {
    db: Db,
    device_shards: Tree,
    wallets: Tree,
    backups: Tree,
    recovery_sessions: Tree,
    audit: Tree,
}

impl WalletDb {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store removed on drop. For tests and dev mode.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            device_shards: db.open_tree(TREE_DEVICE_SHARDS)?,
            wallets: db.open_tree(TREE_WALLETS)?,
            backups: db.open_tree(TREE_BACKUPS)?,
            recovery_sessions: db.open_tree(TREE_RECOVERY_SESSIONS)?,
            audit: db.open_tree(TREE_AUDIT)?,
            db,
        })
    }

    /// Open a named tree directly. Used by integration tests to reach raw
    /// vault bytes.
    pub fn open_tree(&self, name: &str) -> DbResult<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    pub(crate) fn device_shards(&self) -> &Tree {
        &self.device_shards
    }

    pub(crate) fn wallets(&self) -> &Tree {
        &self.wallets
    }

    pub(crate) fn backups(&self) -> &Tree {
        &self.backups
    }

    pub(crate) fn recovery_sessions(&self) -> &Tree {
        &self.recovery_sessions
    }

    pub(crate) fn audit(&self) -> &Tree {
        &self.audit
    }

    /// Next monotonic id, unique for the lifetime of the store.
    pub(crate) fn next_id(&self) -> DbResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Block until every pending write is durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// -- Typed helpers ----------------------------------------------------------

pub(crate) fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

pub(crate) fn get<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> DbResult<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn put<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> DbResult<()> {
    tree.insert(key, encode(value)?)?;
    Ok(())
}
