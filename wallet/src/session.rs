//! # Wallet Session Facade
//!
//! The single entry point for the UI layer. Owns the authoritative
//! [`WalletRecord`] state and exposes only the [`WalletState`] projection.
//!
//! ```text
//! NoWallet ──create/ensure──▶ Provisioning ──▶ Active ◀──unlock── Locked
//!                                 │              │  ▲    ──lock──▶   │
//!                                 ▼ (refused)    ▼  │ (completed)    ▼
//!                              NoWallet         Recovering ◀─────────┘
//! ```
//!
//! A provisioning attempt whose outcome is unknown (outage, lost or
//! unusable response) keeps its `Provisioning` record. The next attempt
//! reuses the record's request id, so the service replays the wallet it
//! created instead of making a second one. If the service already holds a
//! wallet under another request id, the record adopts that wallet's
//! address and the Device shard is restored by recovery.
//!
//! Every operation for a user runs under that user's async mutex and makes
//! at most one collaborator call while holding it. The wallet lookup and
//! the server shard release run between two locked sections.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::backup::{BackupAcknowledgement, BackupArtifact, BackupManager, BackupToken};
use crate::config::{KdfParams, LifecycleConfig};
use crate::crypto::keys::normalize_address;
use crate::error::{WalletError, WalletResult};
use crate::provisioning::{AuthContext, ProvisioningClient, ProvisioningService};
use crate::recovery::{
    ReconstructionService, RecoveryOrchestrator, RecoveryProgress, RecoverySession,
    ShardMaterial,
};
use crate::shard::{
    decrypt_shard, reencrypt_shard, CodecError, DeviceCredential, ShardEnvelope, ShardRole,
    ShardSecret,
};
use crate::storage::{
    AuditEntry, AuditEvent, DeviceShardStatus, LocalShardVault, WalletDb, WalletKey,
    WalletRecord, WalletRegistry, WalletStatus,
};

/// Backup bookkeeping as shown to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupState {
    pub generation: u32,
    pub presented: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// A display-once backup is waiting to be exported.
    pub export_pending: bool,
}

/// Read-only projection of one wallet.
#[derive(Debug, Clone, Serialize)]
pub struct WalletState {
    pub user_id: String,
    pub chain: String,
    pub wallet_address: Option<String>,
    pub status: WalletStatus,
    pub device_shard: DeviceShardStatus,
    pub backup: Option<BackupState>,
    /// Soft warning: the user has not confirmed storing their backup.
    pub backup_warning: bool,
    pub backup_pending_reissue: bool,
    /// A provisioning attempt ended without a usable answer. Retrying
    /// creation resumes it.
    pub provisioning_interrupted: bool,
    pub recovery_session: Option<RecoverySession>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct WalletSession {
    db: WalletDb,
    registry: WalletRegistry,
    vault: LocalShardVault,
    provisioning: ProvisioningClient,
    backups: BackupManager,
    recovery: RecoveryOrchestrator,
    kdf: KdfParams,
    /// Display-once backup tokens, dropped on the next mutating operation.
    tokens: DashMap<WalletKey, BackupToken>,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WalletSession {
    pub fn new(
        db: WalletDb,
        provisioning: Arc<dyn ProvisioningService>,
        reconstruction: Arc<dyn ReconstructionService>,
        config: LifecycleConfig,
    ) -> Self {
        let registry = WalletRegistry::new(&db);
        let vault = LocalShardVault::new(&db);
        let kdf = config.kdf;
        Self {
            provisioning: ProvisioningClient::new(provisioning, config.kdf),
            backups: BackupManager::new(registry.clone()),
            recovery: RecoveryOrchestrator::new(
                registry.clone(),
                vault.clone(),
                reconstruction,
                config,
            ),
            registry,
            vault,
            db,
            kdf,
            tokens: DashMap::new(),
            user_locks: DashMap::new(),
        }
    }

    // -- provisioning ---------------------------------------------------------

    /// Provision a new wallet for `(user_id, chain)`. On success the Device
    /// shard is vaulted and the backup is ready for [`Self::export_backup`].
    pub async fn create_wallet(
        &self,
        user_id: &str,
        chain: &str,
        auth: &AuthContext,
        credential: &DeviceCredential,
    ) -> WalletResult<WalletState> {
        let key = wallet_key(user_id, chain)?;
        let guard = self.lock_user(&key.user_id).await;

        let mut record = match self.registry.wallet(&key)? {
            Some(existing) if existing.status != WalletStatus::Provisioning => {
                return Err(WalletError::DuplicateWallet(key.to_string()));
            }
            Some(existing) => {
                warn!(
                    wallet = %key,
                    outcome_unknown = existing.outcome_unknown,
                    "resuming interrupted provisioning"
                );
                existing
            }
            None => {
                let record = WalletRecord::provisioning(&key);
                self.registry.put_wallet(&record)?;
                record
            }
        };
        info!(wallet = %key, "provisioning wallet");

        let outcome = self
            .provisioning
            .provision(&key, &record.provision_request_id, auth, credential)
            .await;
        let provisioned = match outcome {
            Ok(provisioned) => provisioned,
            Err(e) if e.is_already_provisioned() => {
                warn!(wallet = %key, "service already holds a wallet for this key");
                record.outcome_unknown = true;
                record.updated_at = Utc::now();
                self.registry.put_wallet(&record)?;
                drop(guard);
                return self.adopt_existing(&key, auth).await;
            }
            Err(e) if e.is_refusal() => {
                warn!(wallet = %key, error = %e, "provisioning refused");
                self.registry.remove_wallet(&key)?;
                self.registry
                    .append_audit(&key, AuditEvent::ProvisioningFailed, None, Some(e.to_string()))?;
                return Err(e.into());
            }
            Err(e) => {
                // The service may hold a wallet for this request; keep the
                // record so a retry replays it.
                warn!(wallet = %key, error = %e, "provisioning outcome unknown");
                record.outcome_unknown = true;
                record.updated_at = Utc::now();
                self.registry.put_wallet(&record)?;
                self.registry
                    .append_audit(&key, AuditEvent::ProvisioningFailed, None, Some(e.to_string()))?;
                return Err(e.into());
            }
        };

        self.vault.store(&key, &provisioned.device_envelope)?;
        record.wallet_address = Some(provisioned.wallet_address.clone());
        record.server_shard_id = Some(provisioned.server_shard_id.clone());
        record.outcome_unknown = false;
        record.set_status(WalletStatus::Active);

        let delivered = self.stage_backup(&key, &provisioned.wallet_address, provisioned.backup)?;
        record.backup_pending_reissue = !delivered;
        self.registry.put_wallet(&record)?;
        self.registry.append_audit(
            &key,
            AuditEvent::WalletProvisioned,
            Some(&provisioned.wallet_address),
            Some(provisioned.server_shard_id),
        )?;
        info!(wallet = %key, address = %provisioned.wallet_address, "wallet provisioned");

        if !delivered {
            return Err(WalletError::BackupDelivery {
                wallet_address: provisioned.wallet_address,
            });
        }
        self.state(&record)
    }

    /// Return the wallet for `(user_id, chain)`, provisioning one on first
    /// login.
    pub async fn ensure_wallet(
        &self,
        user_id: &str,
        chain: &str,
        auth: &AuthContext,
        credential: &DeviceCredential,
    ) -> WalletResult<WalletState> {
        let key = wallet_key(user_id, chain)?;
        {
            let _guard = self.lock_user(&key.user_id).await;
            if let Some(record) = self.registry.wallet(&key)? {
                if record.status != WalletStatus::Provisioning {
                    return self.state(&record);
                }
            }
        }
        match self.create_wallet(user_id, chain, auth, credential).await {
            Err(WalletError::DuplicateWallet(_)) => self.get_wallet_state(user_id, chain).await,
            other => other,
        }
    }

    pub async fn get_wallet_state(&self, user_id: &str, chain: &str) -> WalletResult<WalletState> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let record = self.record(&key)?;
        self.state(&record)
    }

    pub async fn wallets_for_user(&self, user_id: &str) -> WalletResult<Vec<WalletState>> {
        let _guard = self.lock_user(user_id).await;
        self.registry
            .wallets_for_user(user_id)?
            .iter()
            .map(|record| self.state(record))
            .collect()
    }

    // -- backup ---------------------------------------------------------------

    /// Hand out the display-once backup. A second call fails with
    /// [`WalletError::BackupUnavailable`].
    pub async fn export_backup(&self, user_id: &str, chain: &str) -> WalletResult<BackupArtifact> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        self.record(&key)?;

        let Some((_, token)) = self.tokens.remove(&key) else {
            warn!(wallet = %key, "backup export requested but no backup is pending");
            return Err(WalletError::BackupUnavailable);
        };
        let generation = token.generation();
        let artifact = self.backups.present(token)?;
        self.registry.append_audit(
            &key,
            AuditEvent::BackupExported,
            Some(&artifact.wallet_address),
            Some(format!("generation {generation}")),
        )?;
        Ok(artifact)
    }

    pub async fn acknowledge_backup(
        &self,
        user_id: &str,
        chain: &str,
    ) -> WalletResult<BackupAcknowledgement> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let record = self.record(&key)?;

        let already = self
            .backups
            .record(&key)?
            .map(|b| b.acknowledgement.is_confirmed())
            .unwrap_or(false);
        let ack = self.backups.acknowledge(&key)?;
        if !already {
            self.registry.append_audit(
                &key,
                AuditEvent::BackupAcknowledged,
                record.wallet_address.as_deref(),
                None,
            )?;
            info!(wallet = %key, "backup acknowledged");
        }
        Ok(ack)
    }

    /// Refresh all shares and issue a new backup shard. The old backup
    /// stops working. The new one is exported with [`Self::export_backup`].
    pub async fn regenerate_backup(
        &self,
        user_id: &str,
        chain: &str,
        auth: &AuthContext,
        credential: &DeviceCredential,
    ) -> WalletResult<WalletState> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let mut record = self.record(&key)?;
        let address = require_status(&record, "regenerate the backup of", &[WalletStatus::Active])?;
        self.tokens.remove(&key);

        let device = self.open_device_shard(&key, credential)?;
        let reissued = self
            .provisioning
            .reissue_backup(&key, &address, &device, auth, credential)
            .await;
        device.wipe();
        let reissued = reissued?;

        self.vault.store(&key, &reissued.device_envelope)?;
        let delivered = self.stage_backup(&key, &address, reissued.backup)?;
        record.backup_pending_reissue = !delivered;
        record.updated_at = Utc::now();
        self.registry.put_wallet(&record)?;
        self.registry.append_audit(
            &key,
            AuditEvent::BackupRegenerated,
            Some(&address),
            (!delivered).then(|| "new backup could not be delivered".to_string()),
        )?;
        info!(wallet = %key, delivered, "backup regenerated; previous backup invalidated");

        if !delivered {
            return Err(WalletError::BackupDelivery {
                wallet_address: address,
            });
        }
        self.state(&record)
    }

    // -- device ---------------------------------------------------------------

    pub async fn change_device_credential(
        &self,
        user_id: &str,
        chain: &str,
        current: &DeviceCredential,
        new: &DeviceCredential,
    ) -> WalletResult<WalletState> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let record = self.record(&key)?;
        let address = require_status(
            &record,
            "change the credential of",
            &[WalletStatus::Active, WalletStatus::Locked],
        )?;
        self.tokens.remove(&key);

        let envelope = self.device_envelope(&key)?;
        let rewrapped = reencrypt_shard(
            &envelope,
            current.as_key(),
            new.as_key(),
            &self.kdf,
        )?;
        self.vault.store(&key, &rewrapped)?;
        self.registry
            .append_audit(&key, AuditEvent::CredentialChanged, Some(&address), None)?;
        info!(wallet = %key, "device credential changed");
        self.state(&record)
    }

    /// Remove this device's shard. The wallet stays recoverable with the
    /// backup and server shards.
    pub async fn deauthorize_device(&self, user_id: &str, chain: &str) -> WalletResult<WalletState> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let record = self.record(&key)?;
        self.tokens.remove(&key);

        let removed = self.vault.remove(&key)?;
        self.registry.append_audit(
            &key,
            AuditEvent::DeviceDeauthorized,
            record.wallet_address.as_deref(),
            None,
        )?;
        info!(wallet = %key, removed, "device deauthorized");
        self.state(&record)
    }

    pub async fn lock_wallet(&self, user_id: &str, chain: &str) -> WalletResult<WalletState> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let mut record = self.record(&key)?;
        let address = require_status(&record, "lock", &[WalletStatus::Active])?;
        self.tokens.remove(&key);

        record.set_status(WalletStatus::Locked);
        self.registry.put_wallet(&record)?;
        self.registry
            .append_audit(&key, AuditEvent::WalletLocked, Some(&address), None)?;
        warn!(wallet = %key, "wallet locked");
        self.state(&record)
    }

    /// Unlock with the device credential. Without a usable Device shard the
    /// way back is recovery.
    pub async fn unlock_wallet(
        &self,
        user_id: &str,
        chain: &str,
        credential: &DeviceCredential,
    ) -> WalletResult<WalletState> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let mut record = self.record(&key)?;
        let address = require_status(&record, "unlock", &[WalletStatus::Locked])?;

        self.open_device_shard(&key, credential)?.wipe();
        record.set_status(WalletStatus::Active);
        self.registry.put_wallet(&record)?;
        self.registry
            .append_audit(&key, AuditEvent::WalletUnlocked, Some(&address), None)?;
        info!(wallet = %key, "wallet unlocked");
        self.state(&record)
    }

    /// Delete the wallet everywhere. `confirmation` must repeat the wallet
    /// address.
    pub async fn delete_wallet(
        &self,
        user_id: &str,
        chain: &str,
        confirmation: &str,
        auth: &AuthContext,
    ) -> WalletResult<()> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let record = self.record(&key)?;
        let address = require_status(
            &record,
            "delete",
            &[WalletStatus::Active, WalletStatus::Locked],
        )?;
        let confirmed = normalize_address(confirmation)
            .map_err(|e| WalletError::InvalidInput(e.to_string()))?;
        if confirmed != address {
            return Err(WalletError::ConfirmationMismatch);
        }

        self.provisioning.delete_wallet(&address, auth).await?;

        self.tokens.remove(&key);
        self.recovery.discard(&key)?;
        self.vault.remove(&key)?;
        self.registry.remove_backup(&key)?;
        self.registry.remove_sessions_for(&key)?;
        self.registry.remove_wallet(&key)?;
        self.registry
            .append_audit(&key, AuditEvent::WalletDeleted, Some(&address), None)?;
        self.db.flush()?;
        warn!(wallet = %key, %address, "wallet deleted");
        Ok(())
    }

    pub fn audit_log(&self, user_id: &str, chain: &str) -> WalletResult<Vec<AuditEntry>> {
        let key = wallet_key(user_id, chain)?;
        Ok(self.registry.audit_for(&key)?)
    }

    // -- recovery -------------------------------------------------------------

    /// Open a recovery session, or return the open one. The Device shard
    /// written on completion is protected by `credential`.
    pub async fn begin_recovery(
        &self,
        user_id: &str,
        chain: &str,
        credential: DeviceCredential,
    ) -> WalletResult<RecoverySession> {
        let key = wallet_key(user_id, chain)?;
        let _guard = self.lock_user(&key.user_id).await;
        let record = self.record(&key)?;
        self.tokens.remove(&key);
        Ok(self.recovery.begin(&record, credential).await?)
    }

    pub async fn submit_recovery_shard(
        &self,
        session_id: &str,
        role: ShardRole,
        material: ShardMaterial,
    ) -> WalletResult<RecoveryProgress> {
        let _guard = self.lock_session_owner(session_id).await?;
        Ok(self.recovery.submit(session_id, role, material).await?)
    }

    /// Feed this device's vaulted shard into a session.
    pub async fn submit_device_shard(
        &self,
        session_id: &str,
        credential: DeviceCredential,
    ) -> WalletResult<RecoveryProgress> {
        let _guard = self.lock_session_owner(session_id).await?;
        let session = self.recovery.session(session_id)?;
        let envelope = self.device_envelope(&session.wallet_key())?;
        Ok(self
            .recovery
            .submit(
                session_id,
                ShardRole::Device,
                ShardMaterial::Envelope {
                    envelope,
                    credential,
                },
            )
            .await?)
    }

    /// Ask the provisioning service to release shard B (it re-verifies
    /// `auth`) and submit it.
    pub async fn request_server_shard(
        &self,
        session_id: &str,
        auth: &AuthContext,
    ) -> WalletResult<RecoveryProgress> {
        let session = {
            let _guard = self.lock_session_owner(session_id).await?;
            self.recovery.session(session_id)?
        };
        if !session.is_open() {
            return Err(WalletError::SessionClosed {
                session_id: session.session_id,
                state: session.state,
            });
        }
        if session.has_role(ShardRole::ServerAssisted) {
            return Err(WalletError::DuplicateShardRole(ShardRole::ServerAssisted));
        }

        let shard: ShardSecret = self
            .provisioning
            .release_server_shard(&session.wallet_address, auth)
            .await?;
        let _guard = self.lock_user(&session.user_id).await;
        Ok(self.recovery.submit_released(session_id, shard).await?)
    }

    /// Retry reconstruction after the reconstruction service was
    /// unreachable.
    pub async fn resume_recovery(&self, session_id: &str) -> WalletResult<RecoveryProgress> {
        let _guard = self.lock_session_owner(session_id).await?;
        Ok(self.recovery.resume(session_id).await?)
    }

    pub async fn cancel_recovery(&self, session_id: &str) -> WalletResult<RecoverySession> {
        let _guard = self.lock_session_owner(session_id).await?;
        Ok(self.recovery.cancel(session_id)?)
    }

    pub async fn recovery_session(&self, session_id: &str) -> WalletResult<RecoverySession> {
        let _guard = self.lock_session_owner(session_id).await?;
        Ok(self.recovery.session(session_id)?)
    }

    // -- internals ------------------------------------------------------------

    /// Bind the `Provisioning` record for `key` to the wallet the service
    /// already holds. The lookup runs outside the user lock. This device has
    /// no Device shard for the wallet, so it comes back through recovery.
    async fn adopt_existing(&self, key: &WalletKey, auth: &AuthContext) -> WalletResult<WalletState> {
        let lookup = self.provisioning.lookup_wallet(key, auth).await;
        let _guard = self.lock_user(&key.user_id).await;

        let mut record = match self.registry.wallet(key)? {
            Some(record) if record.status != WalletStatus::Provisioning => {
                return Err(WalletError::DuplicateWallet(key.to_string()));
            }
            Some(record) => record,
            None => WalletRecord::provisioning(key),
        };
        let existing = match lookup {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                error!(wallet = %key, "service reports a wallet it cannot look up");
                return Err(WalletError::ProvisioningUnresolved(key.to_string()));
            }
            Err(e) => {
                warn!(wallet = %key, error = %e, "wallet lookup failed");
                return Err(e.into());
            }
        };

        record.wallet_address = Some(existing.wallet_address.clone());
        record.server_shard_id = existing.server_shard_id.clone();
        record.outcome_unknown = false;
        record.set_status(WalletStatus::Active);
        self.registry.put_wallet(&record)?;
        self.registry.append_audit(
            key,
            AuditEvent::WalletAdopted,
            Some(&existing.wallet_address),
            existing.server_shard_id,
        )?;
        warn!(
            wallet = %key,
            address = %existing.wallet_address,
            "adopted wallet held by the provisioning service; device shard must be recovered"
        );
        Err(WalletError::DuplicateWallet(key.to_string()))
    }

    /// Lock the user owning a recovery session. The session is looked up
    /// without expiring it; expiry happens under the lock.
    async fn lock_session_owner(&self, session_id: &str) -> WalletResult<OwnedMutexGuard<()>> {
        let user_id = self.recovery.session_owner(session_id)?;
        Ok(self.lock_user(&user_id).await)
    }

    fn record(&self, key: &WalletKey) -> WalletResult<WalletRecord> {
        self.registry
            .wallet(key)?
            .ok_or_else(|| WalletError::WalletNotFound(key.to_string()))
    }

    fn device_envelope(&self, key: &WalletKey) -> WalletResult<ShardEnvelope> {
        self.vault
            .load(key)?
            .ok_or_else(|| WalletError::DeviceShardMissing(key.to_string()))
    }

    fn open_device_shard(
        &self,
        key: &WalletKey,
        credential: &DeviceCredential,
    ) -> WalletResult<ShardSecret> {
        let envelope = self.device_envelope(key)?;
        decrypt_shard(&envelope, credential.as_key()).map_err(|e| {
            if e.is_corruption() {
                error!(wallet = %key, error = %e, "device shard failed integrity check");
            }
            WalletError::from(e)
        })
    }

    /// Turn a delivered backup shard into a pending token. Returns whether
    /// the backup was deliverable.
    fn stage_backup(
        &self,
        key: &WalletKey,
        address: &str,
        backup: Result<ShardSecret, CodecError>,
    ) -> WalletResult<bool> {
        match backup {
            Ok(secret) => {
                let token = self.backups.issue(key, address, secret)?;
                self.tokens.insert(key.clone(), token);
                Ok(true)
            }
            Err(e) => {
                warn!(wallet = %key, error = %e, "backup shard undeliverable; regeneration required");
                Ok(false)
            }
        }
    }

    fn state(&self, record: &WalletRecord) -> WalletResult<WalletState> {
        let key = record.key();
        // Expiring a session can hand the wallet back its previous status.
        let recovery_session = self.recovery.open_session(&key)?;
        let reloaded = self.registry.wallet(&key)?;
        let record = reloaded.as_ref().unwrap_or(record);
        let device_shard = self.vault.inspect(&key)?;
        let export_pending = self.tokens.contains_key(&key);
        let backup = self.backups.record(&key)?.map(|b| BackupState {
            generation: b.generation,
            presented: b.presented_at.is_some(),
            acknowledged_at: b.acknowledgement.confirmed_at,
            export_pending,
        });
        let backup_warning = record.status != WalletStatus::Provisioning
            && (record.backup_pending_reissue
                || !backup
                    .as_ref()
                    .map(|b| b.acknowledged_at.is_some())
                    .unwrap_or(false));

        Ok(WalletState {
            user_id: record.user_id.clone(),
            chain: record.chain.clone(),
            wallet_address: record.wallet_address.clone(),
            status: record.status,
            device_shard,
            backup,
            backup_warning,
            backup_pending_reissue: record.backup_pending_reissue,
            provisioning_interrupted: record.status == WalletStatus::Provisioning
                && record.outcome_unknown,
            recovery_session,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

fn wallet_key(user_id: &str, chain: &str) -> WalletResult<WalletKey> {
    if user_id.trim().is_empty() {
        return Err(WalletError::InvalidInput("user id must not be empty".into()));
    }
    if chain.trim().is_empty() {
        return Err(WalletError::InvalidInput("chain must not be empty".into()));
    }
    Ok(WalletKey::new(user_id, chain))
}

/// The wallet's address, if its status is one of `allowed`.
fn require_status(
    record: &WalletRecord,
    operation: &'static str,
    allowed: &[WalletStatus],
) -> WalletResult<String> {
    match &record.wallet_address {
        Some(address) if allowed.contains(&record.status) => Ok(address.clone()),
        _ => Err(WalletError::InvalidState {
            operation,
            status: record.status,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{Fault, LocalThresholdService};
    use crate::config::KdfParams;
    use crate::error::Remediation;
    use crate::recovery::{FailureReason, SessionState};
    use std::time::Duration;

    fn facade() -> (WalletSession, Arc<LocalThresholdService>) {
        facade_with(LifecycleConfig {
            kdf: KdfParams::insecure_fast(),
            ..LifecycleConfig::default()
        })
    }

    fn facade_with(config: LifecycleConfig) -> (WalletSession, Arc<LocalThresholdService>) {
        let service = Arc::new(LocalThresholdService::new());
        let session = WalletSession::new(
            WalletDb::open_temporary().unwrap(),
            service.clone(),
            service.clone(),
            config,
        );
        (session, service)
    }

    fn auth() -> AuthContext {
        AuthContext::new("token")
    }

    fn pass() -> DeviceCredential {
        DeviceCredential::passphrase("hunter2")
    }

    #[tokio::test]
    async fn create_wallet_vaults_device_shard() {
        let (wallets, _) = facade();
        let state = wallets.create_wallet("u1", "bsc", &auth(), &pass()).await.unwrap();
        assert_eq!(state.chain, "BSC");
        assert_eq!(state.status, WalletStatus::Active);
        assert_eq!(state.device_shard, DeviceShardStatus::Present);
        assert!(state.backup_warning);
        assert!(state.backup.unwrap().export_pending);
    }

    #[tokio::test]
    async fn refused_provisioning_leaves_no_record() {
        let (wallets, service) = facade();
        let err = wallets
            .create_wallet("u1", "BSC", &AuthContext::new(""), &pass())
            .await
            .unwrap_err();
        assert_eq!(err.remediation(), Remediation::None);
        assert!(matches!(
            wallets.get_wallet_state("u1", "BSC").await,
            Err(WalletError::WalletNotFound(_))
        ));
        assert_eq!(service.wallet_count(), 0);
        let audit = wallets.audit_log("u1", "BSC").unwrap();
        assert_eq!(audit.last().unwrap().event, AuditEvent::ProvisioningFailed);
    }

    #[tokio::test]
    async fn outage_keeps_provisioning_record_for_retry() {
        let (wallets, service) = facade();
        service.inject_fault(Fault::Unavailable);
        let err = wallets
            .create_wallet("u1", "BSC", &auth(), &pass())
            .await
            .unwrap_err();
        assert_eq!(err.remediation(), Remediation::Retry);

        let state = wallets.get_wallet_state("u1", "BSC").await.unwrap();
        assert_eq!(state.status, WalletStatus::Provisioning);
        assert!(state.provisioning_interrupted);
        assert!(!state.backup_warning);

        let state = wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        assert_eq!(state.status, WalletStatus::Active);
        assert!(!state.provisioning_interrupted);
        assert_eq!(service.wallet_count(), 1);
    }

    #[tokio::test]
    async fn incomplete_response_is_resumed_with_same_wallet() {
        let (wallets, service) = facade();
        service.inject_fault(Fault::OmitDeviceShard);
        let err = wallets
            .create_wallet("u1", "BSC", &auth(), &pass())
            .await
            .unwrap_err();
        assert_eq!(err.remediation(), Remediation::Retry);

        let state = wallets.ensure_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        assert_eq!(state.status, WalletStatus::Active);
        assert_eq!(state.device_shard, DeviceShardStatus::Present);
        assert_eq!(service.wallet_count(), 1);
    }

    #[tokio::test]
    async fn undeliverable_backup_marks_wallet_for_reissue() {
        let (wallets, service) = facade();
        service.inject_fault(Fault::CorruptBackupShard);
        let err = wallets
            .create_wallet("u1", "BSC", &auth(), &pass())
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::BackupDelivery { .. }));
        assert_eq!(err.remediation(), Remediation::RegenerateBackup);

        let state = wallets.get_wallet_state("u1", "BSC").await.unwrap();
        assert_eq!(state.status, WalletStatus::Active);
        assert!(state.backup_pending_reissue);

        let state = wallets
            .regenerate_backup("u1", "BSC", &auth(), &pass())
            .await
            .unwrap();
        assert!(!state.backup_pending_reissue);
        assert!(wallets.export_backup("u1", "BSC").await.is_ok());
    }

    #[tokio::test]
    async fn acknowledgement_clears_warning() {
        let (wallets, _) = facade();
        wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        wallets.export_backup("u1", "BSC").await.unwrap();
        wallets.acknowledge_backup("u1", "BSC").await.unwrap();
        let state = wallets.get_wallet_state("u1", "BSC").await.unwrap();
        assert!(!state.backup_warning);
        assert!(state.backup.unwrap().acknowledged_at.is_some());
    }

    #[tokio::test]
    async fn backup_token_dropped_by_other_operations() {
        let (wallets, _) = facade();
        wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        wallets.lock_wallet("u1", "BSC").await.unwrap();
        assert!(matches!(
            wallets.export_backup("u1", "BSC").await,
            Err(WalletError::BackupUnavailable)
        ));
    }

    #[tokio::test]
    async fn lock_and_unlock() {
        let (wallets, _) = facade();
        wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        let state = wallets.lock_wallet("u1", "BSC").await.unwrap();
        assert_eq!(state.status, WalletStatus::Locked);
        assert!(matches!(
            wallets.lock_wallet("u1", "BSC").await,
            Err(WalletError::InvalidState { .. })
        ));

        let err = wallets
            .unlock_wallet("u1", "BSC", &DeviceCredential::passphrase("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.remediation(), Remediation::Reprompt);
        let state = wallets.unlock_wallet("u1", "BSC", &pass()).await.unwrap();
        assert_eq!(state.status, WalletStatus::Active);
    }

    #[tokio::test]
    async fn credential_change_rewraps_device_shard() {
        let (wallets, _) = facade();
        wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        let new = DeviceCredential::passphrase("correct horse");
        wallets
            .change_device_credential("u1", "BSC", &pass(), &new)
            .await
            .unwrap();
        wallets.lock_wallet("u1", "BSC").await.unwrap();
        assert!(wallets.unlock_wallet("u1", "BSC", &pass()).await.is_err());
        assert!(wallets.unlock_wallet("u1", "BSC", &new).await.is_ok());
    }

    #[tokio::test]
    async fn deauthorize_removes_only_device_shard() {
        let (wallets, _) = facade();
        wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        let state = wallets.deauthorize_device("u1", "BSC").await.unwrap();
        assert_eq!(state.device_shard, DeviceShardStatus::Absent);
        assert_eq!(state.status, WalletStatus::Active);
    }

    #[tokio::test]
    async fn delete_requires_matching_confirmation() {
        let (wallets, service) = facade();
        let state = wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        let address = state.wallet_address.unwrap();

        let other = format!("0x{}", "ab".repeat(20));
        assert!(matches!(
            wallets.delete_wallet("u1", "BSC", &other, &auth()).await,
            Err(WalletError::ConfirmationMismatch)
        ));

        wallets
            .delete_wallet("u1", "BSC", &address, &auth())
            .await
            .unwrap();
        assert_eq!(service.wallet_count(), 0);
        assert!(matches!(
            wallets.get_wallet_state("u1", "BSC").await,
            Err(WalletError::WalletNotFound(_))
        ));
        // The chain is free again.
        assert!(wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.is_ok());
    }

    #[tokio::test]
    async fn ensure_wallet_is_idempotent() {
        let (wallets, service) = facade();
        let first = wallets.ensure_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        let second = wallets.ensure_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        assert_eq!(first.wallet_address, second.wallet_address);
        assert_eq!(service.wallet_count(), 1);
    }

    #[tokio::test]
    async fn empty_user_id_is_rejected() {
        let (wallets, _) = facade();
        assert!(matches!(
            wallets.create_wallet(" ", "BSC", &auth(), &pass()).await,
            Err(WalletError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn wallets_are_per_chain() {
        let (wallets, _) = facade();
        wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        wallets.create_wallet("u1", "ETH", &auth(), &pass()).await.unwrap();
        assert_eq!(wallets.wallets_for_user("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn expired_recovery_session_hands_back_previous_status() {
        let (wallets, _) = facade_with(LifecycleConfig {
            kdf: KdfParams::insecure_fast(),
            session_ttl: Duration::ZERO,
            ..LifecycleConfig::default()
        });
        wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        let session = wallets.begin_recovery("u1", "BSC", pass()).await.unwrap();

        let err = wallets
            .submit_recovery_shard(
                &session.session_id,
                ShardRole::BackupOwner,
                ShardMaterial::recovery_code("tsc1qqqq"),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                WalletError::SessionClosed {
                    state: SessionState::Failed(FailureReason::Expired),
                    ..
                }
            ),
            "got {err:?}"
        );

        let state = wallets.get_wallet_state("u1", "BSC").await.unwrap();
        assert_eq!(state.status, WalletStatus::Active);
        assert!(state.recovery_session.is_none());
        let audit = wallets.audit_log("u1", "BSC").unwrap();
        assert_eq!(audit.last().unwrap().event, AuditEvent::RecoveryFailed);
        assert!(matches!(
            wallets.cancel_recovery(&session.session_id).await,
            Err(WalletError::SessionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn wallet_state_expires_overdue_session() {
        let (wallets, _) = facade_with(LifecycleConfig {
            kdf: KdfParams::insecure_fast(),
            session_ttl: Duration::ZERO,
            ..LifecycleConfig::default()
        });
        wallets.create_wallet("u1", "BSC", &auth(), &pass()).await.unwrap();
        wallets.lock_wallet("u1", "BSC").await.unwrap();
        let session = wallets.begin_recovery("u1", "BSC", pass()).await.unwrap();

        let state = wallets.get_wallet_state("u1", "BSC").await.unwrap();
        assert_eq!(state.status, WalletStatus::Locked);
        assert!(state.recovery_session.is_none());
        assert_eq!(
            wallets.recovery_session(&session.session_id).await.unwrap().state,
            SessionState::Failed(FailureReason::Expired)
        );
    }
}
