//! # Recovery Orchestrator
//!
//! ```text
//! session.rs    : RecoverySession state machine (persisted)
//! reconstruct.rs: Threshold Reconstruction Service contract + HTTP client
//! mod.rs        : RecoveryOrchestrator: staging, validation, completion
//! ```
//!
//! A session collects shards one role at a time. Each submission is opened
//! through the shard codec, so a damaged or mistyped shard is caught before
//! it is ever staged. Once two distinct roles are staged the orchestrator
//! seals them to the reconstruction service, checks the derived address
//! against the wallet record, re-derives the Device shard and writes it to
//! the vault under the credential given at [`RecoveryOrchestrator::begin`].
//!
//! Staged shard material lives in memory only. Sessions are persisted; after
//! a restart, roles whose material is gone are dropped from the session and
//! must be submitted again.

pub mod reconstruct;
pub mod session;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::LifecycleConfig;
use crate::crypto::keys::normalize_address;
use crate::crypto::TransportSession;
use crate::provisioning::client::seal;
use crate::provisioning::{ProvisioningError, ServiceError};
use crate::shard::{
    decode_recovery_code, decrypt_shard, derive_share, encrypt_shard, CodecError,
    DeviceCredential, ShardEnvelope, ShardRole, ShardSecret, SharingError,
};
use crate::storage::{
    AuditEvent, DbError, LocalShardVault, VaultError, WalletKey, WalletRecord, WalletRegistry,
    WalletStatus,
};

pub use reconstruct::{
    HttpReconstructionService, ReconstructError, ReconstructRequest, ReconstructResponse,
    ReconstructionService, SealedShard, SessionSigner,
};
pub use session::{FailureReason, RecoverySession, SessionState, TransitionError};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("recovery session {0} not found")]
    SessionNotFound(String),

    #[error("recovery session {session_id} is {state}")]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },

    #[error("a {0} shard was already supplied")]
    DuplicateRole(ShardRole),

    /// The in-memory device credential was lost (restart). Begin recovery
    /// again to re-attach it; the open session is reused.
    #[error("device credential required to continue this session")]
    CredentialRequired,

    #[error("wrong passphrase or device key ({attempts_remaining} attempts remaining)")]
    WrongCredential { attempts_remaining: u32 },

    #[error("invalid shard: {reason} ({attempts_remaining} attempts remaining)")]
    InvalidShard {
        reason: String,
        attempts_remaining: u32,
    },

    #[error("too many failed submissions; session closed")]
    TooManyFailedAttempts,

    #[error("shards reconstruct {derived}, expected {expected}")]
    AddressMismatch { expected: String, derived: String },

    #[error("need {needed} distinct shards, have {have}")]
    InsufficientShards { have: usize, needed: usize },

    /// The wallet is not in a state that allows recovery.
    #[error("cannot recover a wallet that is {0}")]
    NotRecoverable(WalletStatus),

    /// Reconstruction service unreachable; staged shards are kept.
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("shard error: {0}")]
    Codec(#[from] CodecError),

    #[error("could not rebuild device shard: {0}")]
    Sharing(#[from] SharingError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("storage error: {0}")]
    Db(#[from] DbError),
}

/// Shard material as a user or device can supply it. Every variant is
/// opened through the shard codec before it is staged.
pub enum ShardMaterial {
    /// A recovery code (`tsc1…`), as printed on a backup.
    RecoveryCode(Zeroizing<String>),
    /// An encrypted envelope plus the credential that opens it.
    Envelope {
        envelope: ShardEnvelope,
        credential: DeviceCredential,
    },
}

impl ShardMaterial {
    pub fn recovery_code(code: impl Into<String>) -> Self {
        ShardMaterial::RecoveryCode(Zeroizing::new(code.into()))
    }

    fn open(self) -> Result<ShardSecret, CodecError> {
        match self {
            ShardMaterial::RecoveryCode(code) => decode_recovery_code(&code),
            ShardMaterial::Envelope {
                envelope,
                credential,
            } => decrypt_shard(&envelope, credential.as_key()),
        }
    }
}

/// Session snapshot after a submission. `signer` is set once completed.
#[derive(Debug, Clone)]
pub struct RecoveryProgress {
    pub session: RecoverySession,
    pub signer: Option<SessionSigner>,
}

#[derive(Default)]
struct StagedRecovery {
    credential: Option<DeviceCredential>,
    shards: Vec<ShardSecret>,
}

impl StagedRecovery {
    fn roles(&self) -> BTreeSet<ShardRole> {
        self.shards.iter().map(|s| s.role()).collect()
    }
}

pub struct RecoveryOrchestrator {
    registry: WalletRegistry,
    vault: LocalShardVault,
    service: Arc<dyn ReconstructionService>,
    config: LifecycleConfig,
    staged: DashMap<String, StagedRecovery>,
    service_key: RwLock<Option<[u8; 32]>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        registry: WalletRegistry,
        vault: LocalShardVault,
        service: Arc<dyn ReconstructionService>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            vault,
            service,
            config,
            staged: DashMap::new(),
            service_key: RwLock::new(None),
        }
    }

    /// Open a recovery session for `record`, or return the one already
    /// open. `credential` protects the Device shard written on completion.
    pub async fn begin(
        &self,
        record: &WalletRecord,
        credential: DeviceCredential,
    ) -> Result<RecoverySession, RecoveryError> {
        let key = record.key();
        let address = match (&record.wallet_address, record.status) {
            (_, WalletStatus::Provisioning) | (None, _) => {
                return Err(RecoveryError::NotRecoverable(record.status))
            }
            (Some(address), _) => address.clone(),
        };

        // Fetch the service key up front so completion is a single call.
        self.service_key().await?;

        if let Some(mut session) = self.open_session(&key)? {
            self.staged
                .entry(session.session_id.clone())
                .or_default()
                .credential = Some(credential);
            self.reconcile(&mut session)?;
            info!(wallet = %key, session = %session.session_id, "resuming open recovery session");
            return Ok(session);
        }

        let previous_status = match record.status {
            WalletStatus::Recovering => WalletStatus::Active,
            other => other,
        };
        let session = RecoverySession::new(
            &key,
            &address,
            previous_status,
            self.config.max_failed_submissions,
            self.config.session_ttl,
        );
        self.registry.put_session(&session)?;
        self.staged.insert(
            session.session_id.clone(),
            StagedRecovery {
                credential: Some(credential),
                shards: Vec::new(),
            },
        );

        let mut record = record.clone();
        record.set_status(WalletStatus::Recovering);
        self.registry.put_wallet(&record)?;
        self.registry.append_audit(
            &key,
            AuditEvent::RecoveryStarted,
            Some(&address),
            Some(session.session_id.clone()),
        )?;
        info!(wallet = %key, session = %session.session_id, "recovery session started");
        Ok(session)
    }

    /// Owner of a session, read without expiring it.
    pub fn session_owner(&self, session_id: &str) -> Result<String, RecoveryError> {
        self.registry
            .session(session_id)?
            .map(|session| session.user_id)
            .ok_or_else(|| RecoveryError::SessionNotFound(session_id.to_string()))
    }

    /// Current state of a session, expiring it if overdue.
    pub fn session(&self, session_id: &str) -> Result<RecoverySession, RecoveryError> {
        let mut session = self
            .registry
            .session(session_id)?
            .ok_or_else(|| RecoveryError::SessionNotFound(session_id.to_string()))?;
        if session.expire_if_due(Utc::now()) {
            self.close(&session, "session expired")?;
        }
        Ok(session)
    }

    /// The open session for a wallet, if any.
    pub fn open_session(&self, key: &WalletKey) -> Result<Option<RecoverySession>, RecoveryError> {
        let now = Utc::now();
        let mut open = None;
        for mut session in self.registry.sessions_for(key)? {
            if session.expire_if_due(now) {
                self.close(&session, "session expired")?;
                continue;
            }
            if session.is_open() {
                open = Some(session);
            }
        }
        Ok(open)
    }

    /// Validate and stage one shard. Triggers reconstruction when this
    /// makes two distinct roles.
    pub async fn submit(
        &self,
        session_id: &str,
        claimed_role: ShardRole,
        material: ShardMaterial,
    ) -> Result<RecoveryProgress, RecoveryError> {
        self.stage(session_id, claimed_role, move || material.open()).await
    }

    /// Stage shard B as released by the provisioning service.
    pub(crate) async fn submit_released(
        &self,
        session_id: &str,
        server_shard: ShardSecret,
    ) -> Result<RecoveryProgress, RecoveryError> {
        self.stage(session_id, ShardRole::ServerAssisted, move || Ok(server_shard)).await
    }

    async fn stage(
        &self,
        session_id: &str,
        claimed_role: ShardRole,
        open: impl FnOnce() -> Result<ShardSecret, CodecError>,
    ) -> Result<RecoveryProgress, RecoveryError> {
        let mut session = self.live_session(session_id)?;

        if session.has_role(claimed_role) {
            warn!(session = %session_id, role = %claimed_role, "duplicate shard role submitted");
            return Err(RecoveryError::DuplicateRole(claimed_role));
        }
        let has_credential = self
            .staged
            .get(session_id)
            .map(|s| s.credential.is_some())
            .unwrap_or(false);
        if !has_credential {
            return Err(RecoveryError::CredentialRequired);
        }

        let secret = match open() {
            Ok(secret) if secret.role() == claimed_role => secret,
            Ok(secret) => {
                let actual = secret.role();
                secret.wipe();
                return Err(self.reject(
                    &mut session,
                    format!("material is a {actual} shard, not {claimed_role}"),
                    false,
                )?);
            }
            Err(e) => {
                let wrong_credential = e.is_wrong_credential();
                if e.is_corruption() {
                    error!(session = %session_id, role = %claimed_role, "submitted shard failed integrity check");
                }
                return Err(self.reject(&mut session, e.to_string(), wrong_credential)?);
            }
        };

        session
            .add_role(claimed_role)
            .map_err(|e| transition_error(&session, e))?;
        self.registry.put_session(&session)?;
        self.staged
            .entry(session_id.to_string())
            .or_default()
            .shards
            .push(secret);
        info!(
            session = %session_id,
            role = %claimed_role,
            supplied = session.supplied_roles.len(),
            "recovery shard accepted"
        );

        if session.is_ready() {
            return self.reconstruct(session).await;
        }
        Ok(RecoveryProgress {
            session,
            signer: None,
        })
    }

    /// Retry reconstruction after the service was unreachable.
    pub async fn resume(&self, session_id: &str) -> Result<RecoveryProgress, RecoveryError> {
        let session = self.live_session(session_id)?;
        if !session.is_ready() {
            return Err(RecoveryError::InsufficientShards {
                have: session.supplied_roles.len(),
                needed: crate::config::SHARD_THRESHOLD as usize,
            });
        }
        self.reconstruct(session).await
    }

    /// Abandon a session and restore the wallet's previous status.
    pub fn cancel(&self, session_id: &str) -> Result<RecoverySession, RecoveryError> {
        let mut session = self.session(session_id)?;
        if !session.is_open() {
            return Err(RecoveryError::SessionClosed {
                session_id: session_id.to_string(),
                state: session.state,
            });
        }
        session.fail(FailureReason::Cancelled);
        self.close(&session, "cancelled")?;
        Ok(session)
    }

    /// Drop all in-memory material for a wallet's sessions.
    pub fn discard(&self, key: &WalletKey) -> Result<(), RecoveryError> {
        for session in self.registry.sessions_for(key)? {
            self.staged.remove(&session.session_id);
        }
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    /// Load a session that can still accept input.
    fn live_session(&self, session_id: &str) -> Result<RecoverySession, RecoveryError> {
        let mut session = self.session(session_id)?;
        if session.state == SessionState::Reconstructing {
            // Left over from an interrupted reconstruction.
            session.revert_to_awaiting();
            self.registry.put_session(&session)?;
        }
        if !session.is_open() {
            return Err(RecoveryError::SessionClosed {
                session_id: session_id.to_string(),
                state: session.state,
            });
        }
        self.reconcile(&mut session)?;
        Ok(session)
    }

    /// Drop roles whose material is no longer staged.
    fn reconcile(&self, session: &mut RecoverySession) -> Result<(), RecoveryError> {
        let staged = self
            .staged
            .get(&session.session_id)
            .map(|s| s.roles())
            .unwrap_or_default();
        let stale: Vec<ShardRole> = session
            .supplied_roles
            .iter()
            .filter(|r| !staged.contains(r))
            .copied()
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        for role in &stale {
            session.drop_role(*role);
        }
        self.registry.put_session(session)?;
        warn!(session = %session.session_id, dropped = ?stale, "staged shards lost; roles must be resubmitted");
        Ok(())
    }

    /// Count a bad submission and build the error to return.
    fn reject(
        &self,
        session: &mut RecoverySession,
        reason: String,
        wrong_credential: bool,
    ) -> Result<RecoveryError, RecoveryError> {
        let closed = session
            .record_failure()
            .map_err(|e| transition_error(session, e))?;
        self.registry.put_session(session)?;
        warn!(
            session = %session.session_id,
            failed = session.failed_submissions,
            max = session.max_failed_submissions,
            "recovery submission rejected"
        );
        if closed {
            self.close(session, "too many failed submissions")?;
            return Ok(RecoveryError::TooManyFailedAttempts);
        }
        let attempts_remaining = session.attempts_remaining();
        Ok(if wrong_credential {
            RecoveryError::WrongCredential { attempts_remaining }
        } else {
            RecoveryError::InvalidShard {
                reason,
                attempts_remaining,
            }
        })
    }

    /// Persist a terminal session and wipe its staged shards. A failed
    /// session is audited and hands the wallet back its previous status.
    fn close(&self, session: &RecoverySession, detail: &str) -> Result<(), RecoveryError> {
        self.registry.put_session(session)?;
        self.staged.remove(&session.session_id);
        if let SessionState::Failed(reason) = session.state {
            if let Some(mut record) = self.registry.wallet(&session.wallet_key())? {
                if record.status == WalletStatus::Recovering {
                    record.set_status(session.previous_status);
                    self.registry.put_wallet(&record)?;
                }
            }
            self.registry.append_audit(
                &session.wallet_key(),
                AuditEvent::RecoveryFailed,
                Some(&session.wallet_address),
                Some(format!("{}: {:?}: {}", session.session_id, reason, detail)),
            )?;
            warn!(session = %session.session_id, ?reason, detail, "recovery session failed");
        }
        Ok(())
    }

    async fn service_key(&self) -> Result<[u8; 32], ServiceError> {
        let cached = *self.service_key.read();
        if let Some(key) = cached {
            return Ok(key);
        }
        let key = self.service.transport_key().await?;
        *self.service_key.write() = Some(key);
        Ok(key)
    }

    async fn reconstruct(
        &self,
        mut session: RecoverySession,
    ) -> Result<RecoveryProgress, RecoveryError> {
        let session_id = session.session_id.clone();
        session
            .begin_reconstruction()
            .map_err(|e| transition_error(&session, e))?;
        self.registry.put_session(&session)?;

        // Take the material out of the map; no map guard is held across the
        // outbound call.
        let Some((_, mut staged)) = self.staged.remove(&session_id) else {
            session.revert_to_awaiting();
            self.registry.put_session(&session)?;
            return Err(RecoveryError::CredentialRequired);
        };

        let outcome = self.call_service(&session, &staged.shards).await;
        let response = match outcome {
            Ok(response) => response,
            Err(ReconstructError::Service(e)) => {
                warn!(session = %session_id, error = %e, "reconstruction service unavailable; shards kept");
                session.revert_to_awaiting();
                self.registry.put_session(&session)?;
                self.staged.insert(session_id, staged);
                return Err(RecoveryError::Service(e));
            }
            Err(ReconstructError::InsufficientShards { .. }) => {
                session.revert_to_awaiting();
                self.registry.put_session(&session)?;
                let have = staged.shards.len();
                self.staged.insert(session_id, staged);
                return Err(RecoveryError::InsufficientShards {
                    have,
                    needed: crate::config::SHARD_THRESHOLD as usize,
                });
            }
            Err(ReconstructError::InvalidShard(reason)) => {
                // The service does not say which shard it refused, so all
                // staged roles are dropped and must be submitted again.
                warn!(session = %session_id, %reason, "reconstruction service refused the shards");
                session.revert_to_awaiting();
                let roles: Vec<ShardRole> = session.supplied_roles.iter().copied().collect();
                for role in roles {
                    session.drop_role(role);
                }
                let credential = staged.credential.take();
                drop(staged);
                self.staged.insert(
                    session_id,
                    StagedRecovery {
                        credential,
                        shards: Vec::new(),
                    },
                );
                return Err(self.reject(&mut session, reason, false)?);
            }
            Err(ReconstructError::AddressMismatch { derived }) => {
                return Err(self.address_mismatch(&mut session, derived)?);
            }
        };

        let derived = normalize_address(&response.derived_address)
            .unwrap_or_else(|_| response.derived_address.clone());
        if derived != session.wallet_address {
            return Err(self.address_mismatch(&mut session, derived)?);
        }

        let credential = match staged.credential.take() {
            Some(credential) => credential,
            None => {
                session.revert_to_awaiting();
                self.registry.put_session(&session)?;
                self.staged.insert(session_id, staged);
                return Err(RecoveryError::CredentialRequired);
            }
        };

        let device = match staged
            .shards
            .iter()
            .position(|s| s.role() == ShardRole::Device)
        {
            Some(index) => staged.shards.swap_remove(index),
            None => {
                let refs: Vec<&ShardSecret> = staged.shards.iter().collect();
                derive_share(&refs, ShardRole::Device)?
            }
        };
        let envelope = encrypt_shard(&device, credential.as_key(), &self.config.kdf)?;
        device.wipe();
        drop(staged);

        let key = session.wallet_key();
        self.vault.store(&key, &envelope)?;

        session
            .complete()
            .map_err(|e| transition_error(&session, e))?;
        self.registry.put_session(&session)?;
        if let Some(mut record) = self.registry.wallet(&key)? {
            record.set_status(WalletStatus::Active);
            self.registry.put_wallet(&record)?;
        }
        self.registry.append_audit(
            &key,
            AuditEvent::RecoveryCompleted,
            Some(&session.wallet_address),
            Some(session_id.clone()),
        )?;
        info!(wallet = %key, session = %session_id, "recovery completed; device shard re-provisioned");

        Ok(RecoveryProgress {
            session,
            signer: Some(response.session_signer),
        })
    }

    async fn call_service(
        &self,
        session: &RecoverySession,
        shards: &[ShardSecret],
    ) -> Result<ReconstructResponse, ReconstructError> {
        let service_key = self.service_key().await?;
        let mut transport = TransportSession::new();
        let transport_key = transport
            .derive_key(&service_key)
            .map_err(|e| ReconstructError::InvalidShard(e.to_string()))?;

        let mut sealed = Vec::with_capacity(shards.len());
        for shard in shards {
            let material = seal(shard, &transport_key)
                .map_err(|e| ReconstructError::InvalidShard(e.to_string()))?;
            sealed.push(SealedShard {
                role: shard.role(),
                material,
            });
        }

        self.service
            .reconstruct(ReconstructRequest {
                wallet_address: session.wallet_address.clone(),
                transport_public_key: transport.public_key_hex(),
                shards: sealed,
            })
            .await
    }

    fn address_mismatch(
        &self,
        session: &mut RecoverySession,
        derived: String,
    ) -> Result<RecoveryError, RecoveryError> {
        error!(
            session = %session.session_id,
            expected = %session.wallet_address,
            derived = %derived,
            "reconstructed address does not match wallet"
        );
        session.fail(FailureReason::AddressMismatch);
        self.close(session, "address mismatch")?;
        Ok(RecoveryError::AddressMismatch {
            expected: session.wallet_address.clone(),
            derived,
        })
    }
}

fn transition_error(session: &RecoverySession, error: TransitionError) -> RecoveryError {
    match error {
        TransitionError::Closed(state) => RecoveryError::SessionClosed {
            session_id: session.session_id.clone(),
            state,
        },
        TransitionError::DuplicateRole(role) => RecoveryError::DuplicateRole(role),
        TransitionError::NotReady { have } => RecoveryError::InsufficientShards {
            have,
            needed: crate::config::SHARD_THRESHOLD as usize,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{Fault, LocalThresholdService};
    use crate::config::KdfParams;
    use crate::crypto::TransportResponder;
    use async_trait::async_trait;
    use crate::provisioning::{AuthContext, ProvisioningClient};
    use crate::shard::encode_recovery_code;
    use crate::storage::WalletDb;

    struct Harness {
        service: Arc<LocalThresholdService>,
        registry: WalletRegistry,
        vault: LocalShardVault,
        orchestrator: RecoveryOrchestrator,
        record: WalletRecord,
        backup_code: String,
        server_shard: Option<ShardSecret>,
    }

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            kdf: KdfParams::insecure_fast(),
            ..LifecycleConfig::default()
        }
    }

    async fn harness() -> Harness {
        let db = WalletDb::open_temporary().expect("temp db");
        let registry = WalletRegistry::new(&db);
        let vault = LocalShardVault::new(&db);
        let service = Arc::new(LocalThresholdService::new());
        let client = ProvisioningClient::new(service.clone(), KdfParams::insecure_fast());

        let key = WalletKey::new("u1", "BSC");
        let auth = AuthContext::new("token");
        let wallet = client
            .provision(&key, "req-1", &auth, &DeviceCredential::passphrase("old"))
            .await
            .unwrap();
        let backup_code = encode_recovery_code(&wallet.backup.unwrap())
            .unwrap()
            .to_string();
        let server_shard = client
            .release_server_shard(&wallet.wallet_address, &auth)
            .await
            .unwrap();

        let mut record = WalletRecord::provisioning(&key);
        record.wallet_address = Some(wallet.wallet_address.clone());
        record.set_status(WalletStatus::Active);
        registry.put_wallet(&record).unwrap();

        let orchestrator =
            RecoveryOrchestrator::new(registry.clone(), vault.clone(), service.clone(), config());
        Harness {
            service,
            registry,
            vault,
            orchestrator,
            record,
            backup_code,
            server_shard: Some(server_shard),
        }
    }

    #[tokio::test]
    async fn backup_and_server_shards_complete_recovery() {
        let mut h = harness().await;
        let session = h
            .orchestrator
            .begin(&h.record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        assert_eq!(
            h.registry.wallet(&h.record.key()).unwrap().unwrap().status,
            WalletStatus::Recovering
        );

        let progress = h
            .orchestrator
            .submit(
                &session.session_id,
                ShardRole::BackupOwner,
                ShardMaterial::recovery_code(h.backup_code.clone()),
            )
            .await
            .unwrap();
        assert_eq!(progress.session.state, SessionState::AwaitingShards);

        let progress = h
            .orchestrator
            .submit_released(&session.session_id, h.server_shard.take().unwrap())
            .await
            .unwrap();
        assert_eq!(progress.session.state, SessionState::Completed);
        assert!(progress.signer.is_some());

        let envelope = h.vault.load(&h.record.key()).unwrap().unwrap();
        assert!(decrypt_shard(&envelope, DeviceCredential::passphrase("new").as_key()).is_ok());
        assert_eq!(
            h.registry.wallet(&h.record.key()).unwrap().unwrap().status,
            WalletStatus::Active
        );
    }

    #[tokio::test]
    async fn begin_is_idempotent() {
        let h = harness().await;
        let first = h
            .orchestrator
            .begin(&h.record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        let record = h.registry.wallet(&h.record.key()).unwrap().unwrap();
        let second = h
            .orchestrator
            .begin(&record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn duplicate_role_does_not_count_as_failure() {
        let h = harness().await;
        let session = h
            .orchestrator
            .begin(&h.record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        let id = &session.session_id;
        h.orchestrator
            .submit(id, ShardRole::BackupOwner, ShardMaterial::recovery_code(h.backup_code.clone()))
            .await
            .unwrap();
        let err = h
            .orchestrator
            .submit(id, ShardRole::BackupOwner, ShardMaterial::recovery_code(h.backup_code.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::DuplicateRole(ShardRole::BackupOwner)));
        assert_eq!(h.orchestrator.session(id).unwrap().failed_submissions, 0);
    }

    #[tokio::test]
    async fn claimed_role_must_match_material() {
        let h = harness().await;
        let session = h
            .orchestrator
            .begin(&h.record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        let err = h
            .orchestrator
            .submit(
                &session.session_id,
                ShardRole::ServerAssisted,
                ShardMaterial::recovery_code(h.backup_code.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::InvalidShard { attempts_remaining: 4, .. }));
    }

    #[tokio::test]
    async fn unavailable_service_keeps_staged_shards() {
        let mut h = harness().await;
        let session = h
            .orchestrator
            .begin(&h.record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        let id = session.session_id.clone();
        h.orchestrator
            .submit(&id, ShardRole::BackupOwner, ShardMaterial::recovery_code(h.backup_code.clone()))
            .await
            .unwrap();

        h.service.inject_fault(Fault::Unavailable);
        let err = h
            .orchestrator
            .submit_released(&id, h.server_shard.take().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Service(ServiceError::Unavailable(_))));
        let session = h.orchestrator.session(&id).unwrap();
        assert_eq!(session.state, SessionState::AwaitingShards);
        assert!(session.is_ready());

        let progress = h.orchestrator.resume(&id).await.unwrap();
        assert_eq!(progress.session.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn cancel_restores_previous_status() {
        let h = harness().await;
        let session = h
            .orchestrator
            .begin(&h.record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        let cancelled = h.orchestrator.cancel(&session.session_id).unwrap();
        assert_eq!(cancelled.state, SessionState::Failed(FailureReason::Cancelled));
        assert_eq!(
            h.registry.wallet(&h.record.key()).unwrap().unwrap().status,
            WalletStatus::Active
        );
        assert!(h.orchestrator.open_session(&h.record.key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_staging_drops_roles_and_requires_credential() {
        let h = harness().await;
        let session = h
            .orchestrator
            .begin(&h.record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        let id = session.session_id.clone();
        h.orchestrator
            .submit(&id, ShardRole::BackupOwner, ShardMaterial::recovery_code(h.backup_code.clone()))
            .await
            .unwrap();

        // A fresh orchestrator over the same store stands in for a restart.
        let restarted = RecoveryOrchestrator::new(
            h.registry.clone(),
            h.vault.clone(),
            h.service.clone(),
            config(),
        );
        let err = restarted
            .submit(&id, ShardRole::BackupOwner, ShardMaterial::recovery_code(h.backup_code.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::CredentialRequired));
        assert!(restarted.session(&id).unwrap().supplied_roles.is_empty());

        let record = h.registry.wallet(&h.record.key()).unwrap().unwrap();
        let resumed = restarted
            .begin(&record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        assert_eq!(resumed.session_id, id);
        restarted
            .submit(&id, ShardRole::BackupOwner, ShardMaterial::recovery_code(h.backup_code.clone()))
            .await
            .unwrap();
    }

    /// Refuses every reconstruction the way the service does for a share
    /// it cannot use.
    struct RefusingReconstruction {
        responder: TransportResponder,
    }

    #[async_trait]
    impl ReconstructionService for RefusingReconstruction {
        async fn transport_key(&self) -> Result<[u8; 32], ServiceError> {
            Ok(self.responder.public_key_bytes())
        }

        async fn reconstruct(
            &self,
            _request: ReconstructRequest,
        ) -> Result<ReconstructResponse, ReconstructError> {
            Err(ReconstructError::InvalidShard("share length mismatch".into()))
        }
    }

    #[tokio::test]
    async fn refused_reconstruction_counts_against_budget() {
        let h = harness().await;
        let orchestrator = RecoveryOrchestrator::new(
            h.registry.clone(),
            h.vault.clone(),
            Arc::new(RefusingReconstruction {
                responder: TransportResponder::generate(),
            }),
            config(),
        );
        let session = orchestrator
            .begin(&h.record, DeviceCredential::passphrase("new"))
            .await
            .unwrap();
        let id = session.session_id.clone();
        let server = h.server_shard.as_ref().unwrap();
        let budget = config().max_failed_submissions;

        for attempt in 1..=budget {
            orchestrator
                .submit(&id, ShardRole::BackupOwner, ShardMaterial::recovery_code(h.backup_code.clone()))
                .await
                .unwrap();
            let copy = ShardSecret::new(server.role(), server.expose().to_vec());
            let err = orchestrator.submit_released(&id, copy).await.unwrap_err();
            let session = orchestrator.session(&id).unwrap();
            if attempt < budget {
                assert!(
                    matches!(err, RecoveryError::InvalidShard { attempts_remaining, .. } if attempts_remaining == budget - attempt),
                    "got {err:?}"
                );
                assert_eq!(session.state, SessionState::AwaitingShards);
                assert!(session.supplied_roles.is_empty());
            } else {
                assert!(matches!(err, RecoveryError::TooManyFailedAttempts), "got {err:?}");
                assert_eq!(
                    session.state,
                    SessionState::Failed(FailureReason::TooManyFailedAttempts)
                );
            }
        }
        assert_eq!(
            h.registry.wallet(&h.record.key()).unwrap().unwrap().status,
            WalletStatus::Active
        );
    }
}
