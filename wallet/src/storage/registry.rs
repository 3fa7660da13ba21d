//! Wallet records, backup state, recovery sessions and the audit log.
//!
//! This is the facade's authoritative state. Nothing here holds secret
//! material: records carry addresses, statuses and timestamps only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::db::{self, DbResult, WalletDb};
use super::WalletKey;
use crate::backup::BackupRecord;
use crate::recovery::session::RecoverySession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Provisioning,
    Active,
    Locked,
    Recovering,
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WalletStatus::Provisioning => "provisioning",
            WalletStatus::Active => "active",
            WalletStatus::Locked => "locked",
            WalletStatus::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub user_id: String,
    pub chain: String,
    /// Set once from the provisioning response and never changed. `None`
    /// only while the record is `Provisioning`.
    pub wallet_address: Option<String>,
    pub status: WalletStatus,
    /// Opaque handle to shard B at the provisioning service.
    pub server_shard_id: Option<String>,
    /// The backup shard was lost between the service and the user. Cleared
    /// by a successful backup regeneration.
    pub backup_pending_reissue: bool,
    /// Idempotency key sent with every provisioning attempt for this
    /// record. A retry with the same key gets the original wallet back.
    pub provision_request_id: String,
    /// The last provisioning attempt may have succeeded server-side without
    /// the response reaching us.
    pub outcome_unknown: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletRecord {
    pub fn provisioning(key: &WalletKey) -> Self {
        let now = Utc::now();
        Self {
            user_id: key.user_id.clone(),
            chain: key.chain.clone(),
            wallet_address: None,
            status: WalletStatus::Provisioning,
            server_shard_id: None,
            backup_pending_reissue: false,
            provision_request_id: Uuid::new_v4().to_string(),
            outcome_unknown: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> WalletKey {
        WalletKey {
            user_id: self.user_id.clone(),
            chain: self.chain.clone(),
        }
    }

    pub fn set_status(&mut self, status: WalletStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    WalletProvisioned,
    /// Bound to a wallet the provisioning service already held.
    WalletAdopted,
    ProvisioningFailed,
    BackupExported,
    BackupAcknowledged,
    BackupRegenerated,
    CredentialChanged,
    DeviceDeauthorized,
    WalletLocked,
    WalletUnlocked,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
    WalletDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub user_id: String,
    pub chain: String,
    pub event: AuditEvent,
    pub wallet_address: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WalletRegistry {
    db: WalletDb,
}

impl WalletRegistry {
    pub fn new(db: &WalletDb) -> Self {
        Self { db: db.clone() }
    }

    // -- Wallet records -----------------------------------------------------

    pub fn wallet(&self, key: &WalletKey) -> DbResult<Option<WalletRecord>> {
        db::get(self.db.wallets(), &key.storage_key())
    }

    pub fn put_wallet(&self, record: &WalletRecord) -> DbResult<()> {
        db::put(self.db.wallets(), &record.key().storage_key(), record)?;
        self.db.wallets().flush()?;
        Ok(())
    }

    pub fn remove_wallet(&self, key: &WalletKey) -> DbResult<bool> {
        let removed = self.db.wallets().remove(key.storage_key())?.is_some();
        self.db.wallets().flush()?;
        Ok(removed)
    }

    /// Every wallet of `user_id`, across chains.
    pub fn wallets_for_user(&self, user_id: &str) -> DbResult<Vec<WalletRecord>> {
        let mut records = Vec::new();
        for item in self.db.wallets().scan_prefix(WalletKey::user_prefix(user_id)) {
            let (_, value) = item?;
            records.push(db::decode(&value)?);
        }
        Ok(records)
    }

    // -- Backup state -------------------------------------------------------

    pub fn backup(&self, key: &WalletKey) -> DbResult<Option<BackupRecord>> {
        db::get(self.db.backups(), &key.storage_key())
    }

    pub fn put_backup(&self, key: &WalletKey, record: &BackupRecord) -> DbResult<()> {
        db::put(self.db.backups(), &key.storage_key(), record)?;
        self.db.backups().flush()?;
        Ok(())
    }

    pub fn remove_backup(&self, key: &WalletKey) -> DbResult<()> {
        self.db.backups().remove(key.storage_key())?;
        Ok(())
    }

    // -- Recovery sessions --------------------------------------------------

    pub fn session(&self, session_id: &str) -> DbResult<Option<RecoverySession>> {
        db::get(self.db.recovery_sessions(), session_id.as_bytes())
    }

    pub fn put_session(&self, session: &RecoverySession) -> DbResult<()> {
        db::put(
            self.db.recovery_sessions(),
            session.session_id.as_bytes(),
            session,
        )?;
        self.db.recovery_sessions().flush()?;
        Ok(())
    }

    /// All sessions for a wallet, oldest first.
    pub fn sessions_for(&self, key: &WalletKey) -> DbResult<Vec<RecoverySession>> {
        let mut sessions = Vec::new();
        for item in self.db.recovery_sessions().iter() {
            let (_, value) = item?;
            let session: RecoverySession = db::decode(&value)?;
            if session.user_id == key.user_id && session.chain == key.chain {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    pub fn remove_sessions_for(&self, key: &WalletKey) -> DbResult<usize> {
        let sessions = self.sessions_for(key)?;
        for session in &sessions {
            self.db
                .recovery_sessions()
                .remove(session.session_id.as_bytes())?;
        }
        Ok(sessions.len())
    }

    // -- Audit log ----------------------------------------------------------

    pub fn append_audit(
        &self,
        key: &WalletKey,
        event: AuditEvent,
        wallet_address: Option<&str>,
        detail: Option<String>,
    ) -> DbResult<()> {
        let entry = AuditEntry {
            at: Utc::now(),
            user_id: key.user_id.clone(),
            chain: key.chain.clone(),
            event,
            wallet_address: wallet_address.map(str::to_owned),
            detail,
        };
        let id = self.db.next_id()?;
        db::put(self.db.audit(), &id.to_be_bytes(), &entry)?;
        Ok(())
    }

    /// Audit trail of one wallet in insertion order.
    pub fn audit_for(&self, key: &WalletKey) -> DbResult<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for item in self.db.audit().iter() {
            let (_, value) = item?;
            let entry: AuditEntry = db::decode(&value)?;
            if entry.user_id == key.user_id && entry.chain == key.chain {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WalletRegistry {
        WalletRegistry::new(&WalletDb::open_temporary().expect("temp db"))
    }

    #[test]
    fn wallet_record_crud() {
        let reg = registry();
        let key = WalletKey::new("u1", "BSC");
        assert!(reg.wallet(&key).unwrap().is_none());

        let mut record = WalletRecord::provisioning(&key);
        reg.put_wallet(&record).unwrap();
        assert_eq!(
            reg.wallet(&key).unwrap().unwrap().status,
            WalletStatus::Provisioning
        );

        record.wallet_address = Some("0xabc".into());
        record.set_status(WalletStatus::Active);
        reg.put_wallet(&record).unwrap();
        let stored = reg.wallet(&key).unwrap().unwrap();
        assert_eq!(stored.status, WalletStatus::Active);
        assert_eq!(stored.wallet_address.as_deref(), Some("0xabc"));

        assert!(reg.remove_wallet(&key).unwrap());
        assert!(reg.wallet(&key).unwrap().is_none());
    }

    #[test]
    fn wallets_for_user_spans_chains() {
        let reg = registry();
        reg.put_wallet(&WalletRecord::provisioning(&WalletKey::new("u1", "BSC")))
            .unwrap();
        reg.put_wallet(&WalletRecord::provisioning(&WalletKey::new("u1", "ETH")))
            .unwrap();
        reg.put_wallet(&WalletRecord::provisioning(&WalletKey::new("u10", "BSC")))
            .unwrap();
        let wallets = reg.wallets_for_user("u1").unwrap();
        assert_eq!(wallets.len(), 2);
        assert!(wallets.iter().all(|w| w.user_id == "u1"));
    }

    #[test]
    fn audit_log_is_ordered_and_scoped() {
        let reg = registry();
        let key = WalletKey::new("u1", "BSC");
        let other = WalletKey::new("u2", "BSC");
        reg.append_audit(&key, AuditEvent::WalletProvisioned, Some("0x1"), None)
            .unwrap();
        reg.append_audit(&other, AuditEvent::WalletProvisioned, None, None)
            .unwrap();
        reg.append_audit(&key, AuditEvent::BackupExported, Some("0x1"), None)
            .unwrap();

        let events: Vec<_> = reg
            .audit_for(&key)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![AuditEvent::WalletProvisioned, AuditEvent::BackupExported]
        );
    }
}
