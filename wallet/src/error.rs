//! Public error taxonomy of the wallet facade.
//!
//! Component errors are folded into [`WalletError`], one variant per thing
//! the caller can act on. [`WalletError::remediation`] names that action.
//! Integrity failures always surface as [`WalletError::Corruption`] and are
//! never reported as a wrong credential.

use serde::Serialize;
use thiserror::Error;

use crate::backup::BackupError;
use crate::provisioning::{ProvisioningError, ServiceError};
use crate::recovery::{RecoveryError, SessionState};
use crate::shard::{CodecError, ShardRole, SharingError};
use crate::storage::{DbError, VaultError, WalletStatus};

/// Collaborator error code for a wallet that already exists server-side.
pub const CODE_ALREADY_PROVISIONED: &str = "already_provisioned";

#[derive(Debug, Error)]
pub enum WalletError {
    /// Provisioning did not complete. Check wallet state before retrying.
    #[error("provisioning failed: {message}")]
    Provisioning { message: String, retriable: bool },

    /// The service claims a wallet for this user and chain but cannot
    /// produce it.
    #[error("provisioning for {0} cannot be resolved with the service")]
    ProvisioningUnresolved(String),

    /// The wallet exists but its backup shard never reached the user.
    #[error("wallet {wallet_address} was created but its backup could not be delivered")]
    BackupDelivery { wallet_address: String },

    #[error("wrong passphrase or device key")]
    Decryption { attempts_remaining: Option<u32> },

    /// Stored or supplied shard material is damaged.
    #[error("shard data is corrupted: {0}")]
    Corruption(String),

    #[error("need {needed} distinct shards, have {have}")]
    InsufficientShards { have: usize, needed: usize },

    #[error("invalid shard: {reason}")]
    InvalidShard {
        reason: String,
        attempts_remaining: Option<u32>,
    },

    #[error("shards reconstruct {derived}, expected {expected}")]
    AddressMismatch { expected: String, derived: String },

    #[error("a wallet already exists for {0}")]
    DuplicateWallet(String),

    #[error("no wallet for {0}")]
    WalletNotFound(String),

    #[error("no device shard on this device for {0}")]
    DeviceShardMissing(String),

    #[error("cannot {operation} a wallet that is {status}")]
    InvalidState {
        operation: &'static str,
        status: WalletStatus,
    },

    /// The display-once backup was already shown, or never issued.
    #[error("backup is not available for export")]
    BackupUnavailable,

    #[error("recovery session {0} not found")]
    SessionNotFound(String),

    #[error("recovery session {session_id} is {state}")]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },

    #[error("a {0} shard was already supplied")]
    DuplicateShardRole(ShardRole),

    #[error("device credential required to continue recovery")]
    CredentialRequired,

    #[error("too many failed submissions; recovery session closed")]
    TooManyFailedAttempts,

    #[error("confirmation does not match the wallet address")]
    ConfirmationMismatch,

    #[error("collaborator unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("collaborator rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// What the caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    /// Ask the user for the credential or input again.
    Reprompt,
    /// Try again later, after checking wallet state.
    Retry,
    /// Start (or restart) recovery with two other shards.
    Recover,
    /// Regenerate the backup shard.
    RegenerateBackup,
    ContactSupport,
    None,
}

impl WalletError {
    pub fn remediation(&self) -> Remediation {
        use WalletError::*;
        match self {
            Provisioning { retriable: true, .. } | ServiceUnavailable(_) => Remediation::Retry,
            Provisioning { .. } | Rejected { .. } => Remediation::None,
            BackupDelivery { .. } | BackupUnavailable => Remediation::RegenerateBackup,
            Decryption { .. }
            | InvalidShard { .. }
            | CredentialRequired
            | ConfirmationMismatch
            | InvalidInput(_) => Remediation::Reprompt,
            Corruption(_) | DeviceShardMissing(_) | TooManyFailedAttempts => Remediation::Recover,
            SessionClosed { .. } => Remediation::Recover,
            AddressMismatch { .. } | ProvisioningUnresolved(_) | Storage(_) | Internal(_) => {
                Remediation::ContactSupport
            }
            InsufficientShards { .. }
            | DuplicateWallet(_)
            | WalletNotFound(_)
            | InvalidState { .. }
            | SessionNotFound(_)
            | DuplicateShardRole(_) => Remediation::None,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        use WalletError::*;
        match self {
            Provisioning { .. } => "provisioning_failed",
            ProvisioningUnresolved(_) => "provisioning_unresolved",
            BackupDelivery { .. } => "backup_delivery_failed",
            Decryption { .. } => "wrong_credential",
            Corruption(_) => "corrupted",
            InsufficientShards { .. } => "insufficient_shards",
            InvalidShard { .. } => "invalid_shard",
            AddressMismatch { .. } => "address_mismatch",
            DuplicateWallet(_) => "duplicate_wallet",
            WalletNotFound(_) => "wallet_not_found",
            DeviceShardMissing(_) => "device_shard_missing",
            InvalidState { .. } => "invalid_state",
            BackupUnavailable => "backup_unavailable",
            SessionNotFound(_) => "session_not_found",
            SessionClosed { .. } => "session_closed",
            DuplicateShardRole(_) => "duplicate_shard_role",
            CredentialRequired => "credential_required",
            TooManyFailedAttempts => "too_many_failed_attempts",
            ConfirmationMismatch => "confirmation_mismatch",
            ServiceUnavailable(_) => "service_unavailable",
            Rejected { .. } => "rejected",
            Storage(_) => "storage",
            InvalidInput(_) => "invalid_input",
            Internal(_) => "internal",
        }
    }

    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            WalletError::Corruption(_) | WalletError::AddressMismatch { .. }
        )
    }
}

pub type WalletResult<T> = Result<T, WalletError>;

impl From<DbError> for WalletError {
    fn from(e: DbError) -> Self {
        WalletError::Storage(e.to_string())
    }
}

impl From<VaultError> for WalletError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Corrupted { .. } => WalletError::Corruption(e.to_string()),
            VaultError::WrongRole(role) => {
                WalletError::Internal(format!("attempted to vault a {role} shard"))
            }
            VaultError::Db(db) => db.into(),
        }
    }
}

impl From<CodecError> for WalletError {
    fn from(e: CodecError) -> Self {
        if e.is_wrong_credential() {
            return WalletError::Decryption {
                attempts_remaining: None,
            };
        }
        match e {
            CodecError::InvalidCode(reason) => WalletError::InvalidShard {
                reason,
                attempts_remaining: None,
            },
            CodecError::Kdf(kdf) => WalletError::Internal(kdf.to_string()),
            other => WalletError::Corruption(other.to_string()),
        }
    }
}

impl From<SharingError> for WalletError {
    fn from(e: SharingError) -> Self {
        WalletError::Internal(e.to_string())
    }
}

impl From<ServiceError> for WalletError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Rejected {
                status, message, ..
            } => WalletError::Rejected { status, message },
            ServiceError::Unavailable(m) | ServiceError::Malformed(m) => {
                WalletError::ServiceUnavailable(m)
            }
        }
    }
}

impl From<ProvisioningError> for WalletError {
    fn from(e: ProvisioningError) -> Self {
        if let ProvisioningError::Service(service) = &e {
            if service.code() == Some(CODE_ALREADY_PROVISIONED) {
                return WalletError::DuplicateWallet(service.to_string());
            }
        }
        WalletError::Provisioning {
            retriable: e.is_retriable(),
            message: e.to_string(),
        }
    }
}

impl From<RecoveryError> for WalletError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::SessionNotFound(id) => WalletError::SessionNotFound(id),
            RecoveryError::SessionClosed { session_id, state } => {
                WalletError::SessionClosed { session_id, state }
            }
            RecoveryError::DuplicateRole(role) => WalletError::DuplicateShardRole(role),
            RecoveryError::CredentialRequired => WalletError::CredentialRequired,
            RecoveryError::WrongCredential { attempts_remaining } => WalletError::Decryption {
                attempts_remaining: Some(attempts_remaining),
            },
            RecoveryError::InvalidShard {
                reason,
                attempts_remaining,
            } => WalletError::InvalidShard {
                reason,
                attempts_remaining: Some(attempts_remaining),
            },
            RecoveryError::TooManyFailedAttempts => WalletError::TooManyFailedAttempts,
            RecoveryError::AddressMismatch { expected, derived } => {
                WalletError::AddressMismatch { expected, derived }
            }
            RecoveryError::InsufficientShards { have, needed } => {
                WalletError::InsufficientShards { have, needed }
            }
            RecoveryError::NotRecoverable(status) => WalletError::InvalidState {
                operation: "recover",
                status,
            },
            RecoveryError::Service(service) => service.into(),
            RecoveryError::Codec(codec) => codec.into(),
            RecoveryError::Sharing(sharing) => sharing.into(),
            RecoveryError::Provisioning(provisioning) => provisioning.into(),
            RecoveryError::Vault(vault) => vault.into(),
            RecoveryError::Db(db) => db.into(),
        }
    }
}

impl From<BackupError> for WalletError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::NotIssued(_) => WalletError::BackupUnavailable,
            BackupError::WrongRole(role) => {
                WalletError::Internal(format!("{role} shard handed to backup manager"))
            }
            BackupError::Render(m) => WalletError::Internal(m),
            BackupError::Codec(codec) => codec.into(),
            BackupError::Db(db) => db.into(),
        }
    }
}
