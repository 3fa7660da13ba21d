//! # Backup Manager
//!
//! Shard C is shown to the user exactly once. The plaintext lives in a
//! [`BackupToken`] that is consumed by [`BackupManager::present`]; once the
//! token is gone there is no way to see the same shard again. The only
//! recourse is a backup regeneration, which refreshes all shares and mints a
//! new token.
//!
//! What *is* persisted is a [`BackupRecord`]: which generation was issued,
//! whether it was presented, and whether the user confirmed they stored it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::shard::{encode_recovery_code, CodecError, ShardRole, ShardSecret};
use crate::storage::{DbError, WalletKey, WalletRegistry};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("no backup has been issued for {0}")]
    NotIssued(String),

    #[error("token is for a {0} shard, not the backup shard")]
    WrongRole(ShardRole),

    #[error("could not render backup: {0}")]
    Render(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("storage error: {0}")]
    Db(#[from] DbError),
}

/// Whether and when the user confirmed they stored their backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAcknowledgement {
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl BackupAcknowledgement {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

/// Durable backup bookkeeping for one wallet. No shard material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Bumped on every regeneration; earlier generations no longer recover.
    pub generation: u32,
    pub issued_at: DateTime<Utc>,
    pub presented_at: Option<DateTime<Utc>>,
    pub acknowledgement: BackupAcknowledgement,
}

/// Display-once handle on the plaintext backup shard. Not `Clone`.
pub struct BackupToken {
    key: WalletKey,
    wallet_address: String,
    generation: u32,
    secret: ShardSecret,
}

impl BackupToken {
    pub fn wallet_key(&self) -> &WalletKey {
        &self.key
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for BackupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupToken")
            .field("wallet", &self.key.to_string())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// What the user gets to see and save.
pub struct BackupArtifact {
    pub wallet_address: String,
    pub chain: String,
    pub generation: u32,
    /// Recovery code grouped for copying by hand.
    pub display_text: Zeroizing<String>,
    pub file_name: String,
    /// JSON document holding the recovery code.
    pub file_contents: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for BackupArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupArtifact")
            .field("wallet_address", &self.wallet_address)
            .field("generation", &self.generation)
            .field("file_name", &self.file_name)
            .field("display_text", &"***SENSITIVE***")
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupFile<'a> {
    format: &'static str,
    version: u8,
    wallet_address: &'a str,
    chain: &'a str,
    generation: u32,
    recovery_code: &'a str,
    created_at: DateTime<Utc>,
}

const BACKUP_FILE_FORMAT: &str = "trishard-backup";
const CODE_GROUP_SIZE: usize = 6;

#[derive(Debug, Clone)]
pub struct BackupManager {
    registry: WalletRegistry,
}

impl BackupManager {
    pub fn new(registry: WalletRegistry) -> Self {
        Self { registry }
    }

    /// Record a newly issued backup shard and wrap it in a token. Resets any
    /// earlier acknowledgement.
    pub fn issue(
        &self,
        key: &WalletKey,
        wallet_address: &str,
        secret: ShardSecret,
    ) -> Result<BackupToken, BackupError> {
        if secret.role() != ShardRole::BackupOwner {
            return Err(BackupError::WrongRole(secret.role()));
        }
        let generation = match self.registry.backup(key)? {
            Some(previous) => previous.generation + 1,
            None => 1,
        };
        self.registry.put_backup(
            key,
            &BackupRecord {
                generation,
                issued_at: Utc::now(),
                presented_at: None,
                acknowledgement: BackupAcknowledgement::default(),
            },
        )?;
        info!(wallet = %key, generation, "backup shard issued");
        Ok(BackupToken {
            key: key.clone(),
            wallet_address: wallet_address.to_string(),
            generation,
            secret,
        })
    }

    /// Render the backup for display. Consumes the token; the shard
    /// plaintext is wiped before this returns.
    pub fn present(&self, token: BackupToken) -> Result<BackupArtifact, BackupError> {
        let BackupToken {
            key,
            wallet_address,
            generation,
            secret,
        } = token;

        let code = encode_recovery_code(&secret)?;
        secret.wipe();

        let file_name = format!(
            "trishard-backup-{}-{}.json",
            key.chain.to_ascii_lowercase(),
            &wallet_address[..wallet_address.len().min(10)]
        );
        let file_contents = serde_json::to_vec_pretty(&BackupFile {
            format: BACKUP_FILE_FORMAT,
            version: 1,
            wallet_address: &wallet_address,
            chain: &key.chain,
            generation,
            recovery_code: &code,
            created_at: Utc::now(),
        })
        .map(Zeroizing::new)
        .map_err(|e| BackupError::Render(e.to_string()))?;

        if let Some(mut record) = self.registry.backup(&key)? {
            record.presented_at = Some(Utc::now());
            self.registry.put_backup(&key, &record)?;
        }
        info!(wallet = %key, generation, "backup presented");

        Ok(BackupArtifact {
            chain: key.chain.clone(),
            wallet_address,
            generation,
            display_text: group_code(&code),
            file_name,
            file_contents,
        })
    }

    pub fn acknowledge(&self, key: &WalletKey) -> Result<BackupAcknowledgement, BackupError> {
        let mut record = self
            .registry
            .backup(key)?
            .ok_or_else(|| BackupError::NotIssued(key.to_string()))?;
        if record.presented_at.is_none() {
            warn!(wallet = %key, "backup acknowledged before it was presented");
        }
        if record.acknowledgement.confirmed_at.is_none() {
            record.acknowledgement.confirmed_at = Some(Utc::now());
            self.registry.put_backup(key, &record)?;
        }
        Ok(record.acknowledgement)
    }

    pub fn record(&self, key: &WalletKey) -> Result<Option<BackupRecord>, BackupError> {
        Ok(self.registry.backup(key)?)
    }
}

/// `tsc1qqqqqq pppppp ...`: groups of six for transcription.
fn group_code(code: &str) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::with_capacity(code.len() + code.len() / CODE_GROUP_SIZE));
    for (i, c) in code.chars().enumerate() {
        if i > 0 && i % CODE_GROUP_SIZE == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}
