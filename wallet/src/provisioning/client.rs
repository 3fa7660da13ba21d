//! Client side of the provisioning contract.
//!
//! Turns raw collaborator responses into local state: checks the response is
//! complete, unseals the transported shards and re-encrypts the Device shard
//! under the user's device credential. It never touches the vault or the
//! registry itself; the facade decides what to persist.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{
    parse_public_key, AuthContext, DeleteRequest, LookupRequest, ProvisionRequest,
    ProvisioningService, ReissueRequest, ReleaseRequest, ServiceError,
};
use crate::config::{KdfParams, AES_KEY_LENGTH};
use crate::error::CODE_ALREADY_PROVISIONED;
use crate::crypto::keys::{normalize_address, AddressError};
use crate::crypto::{TransportError, TransportSession};
use crate::shard::codec::{envelope_from_wire, envelope_to_wire};
use crate::shard::{
    decrypt_shard, encrypt_shard, CodecError, DeviceCredential, ShardEnvelope, ShardKey,
    ShardRole, ShardSecret,
};
use crate::storage::WalletKey;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The response lacks a required field. Retry the whole operation.
    #[error("incomplete response: missing {0}")]
    Incomplete(&'static str),

    #[error("collaborator returned an invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("transport key exchange failed: {0}")]
    Transport(#[from] TransportError),

    /// A sealed shard could not be opened or re-encrypted.
    #[error("shard envelope error: {0}")]
    Envelope(#[source] CodecError),
}

impl ProvisioningError {
    /// Caller errors (4xx) are not worth retrying; everything else is, once
    /// the caller has checked wallet state.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            ProvisioningError::Service(ServiceError::Rejected { .. })
        )
    }

    /// The service already holds a wallet for this user and chain under a
    /// different request id.
    pub fn is_already_provisioned(&self) -> bool {
        matches!(self, ProvisioningError::Service(s) if s.code() == Some(CODE_ALREADY_PROVISIONED))
    }

    /// The service refused the request, so nothing was created. Any other
    /// failure may have left a wallet behind on the service side.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            ProvisioningError::Service(ServiceError::Rejected { .. })
        ) && !self.is_already_provisioned()
    }
}

/// A wallet the provisioning service already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingWallet {
    pub wallet_address: String,
    pub server_shard_id: Option<String>,
}

/// A freshly provisioned wallet, ready for the facade to persist.
#[derive(Debug)]
pub struct ProvisionedWallet {
    pub wallet_address: String,
    pub server_shard_id: String,
    /// Device shard, already under the device credential.
    pub device_envelope: ShardEnvelope,
    /// The display-once backup shard, or why it could not be opened.
    pub backup: Result<ShardSecret, CodecError>,
}

/// Output of a backup reissue. Shares were refreshed server-side, so the
/// Device envelope must replace the vaulted one even if the backup shard
/// failed to open.
#[derive(Debug)]
pub struct ReissuedShards {
    pub device_envelope: ShardEnvelope,
    pub backup: Result<ShardSecret, CodecError>,
}

#[derive(Clone)]
pub struct ProvisioningClient {
    service: Arc<dyn ProvisioningService>,
    kdf: KdfParams,
}

impl ProvisioningClient {
    pub fn new(service: Arc<dyn ProvisioningService>, kdf: KdfParams) -> Self {
        Self { service, kdf }
    }

    /// Provision a new wallet for `key`. Retrying with the same
    /// `request_id` returns the wallet of the first attempt.
    pub async fn provision(
        &self,
        key: &WalletKey,
        request_id: &str,
        auth: &AuthContext,
        credential: &DeviceCredential,
    ) -> Result<ProvisionedWallet, ProvisioningError> {
        let mut transport = TransportSession::new();
        let response = self
            .service
            .provision(ProvisionRequest {
                user_id: key.user_id.clone(),
                chain: key.chain.clone(),
                request_id: request_id.to_string(),
                auth_proof: auth.proof().to_string(),
                transport_public_key: transport.public_key_hex(),
            })
            .await?;

        // All-or-nothing: check every field before using any.
        let address = response
            .wallet_address
            .ok_or(ProvisioningError::Incomplete("wallet address"))?;
        let device_wire = response
            .device_shard
            .ok_or(ProvisioningError::Incomplete("device shard"))?;
        let backup_wire = response
            .backup_shard
            .ok_or(ProvisioningError::Incomplete("backup shard"))?;
        let server_shard_id = response
            .server_shard_id
            .ok_or(ProvisioningError::Incomplete("server shard id"))?;
        let peer = response
            .transport_public_key
            .ok_or(ProvisioningError::Incomplete("transport public key"))?;

        let wallet_address = normalize_address(&address)?;
        let transport_key = transport.derive_key(&parse_public_key(&peer)?)?;

        let device_envelope = self.rewrap_device(&device_wire, &transport_key, credential)?;
        let backup = unseal(&backup_wire, ShardRole::BackupOwner, &transport_key);
        if let Err(e) = &backup {
            warn!(wallet = %key, error = %e, "backup shard could not be opened");
        }

        debug!(wallet = %key, address = %wallet_address, "provisioning response accepted");
        Ok(ProvisionedWallet {
            wallet_address,
            server_shard_id,
            device_envelope,
            backup,
        })
    }

    /// Ask the collaborator to refresh all shares and issue a new backup
    /// shard. `device` is the current plaintext Device shard.
    pub async fn reissue_backup(
        &self,
        key: &WalletKey,
        wallet_address: &str,
        device: &ShardSecret,
        auth: &AuthContext,
        credential: &DeviceCredential,
    ) -> Result<ReissuedShards, ProvisioningError> {
        let mut transport = TransportSession::new();
        let service_key = self.service.transport_key().await?;
        let transport_key = transport.derive_key(&service_key)?;

        let sealed = seal(device, &transport_key)?;
        let response = self
            .service
            .reissue_backup(ReissueRequest {
                user_id: key.user_id.clone(),
                chain: key.chain.clone(),
                wallet_address: wallet_address.to_string(),
                auth_proof: auth.proof().to_string(),
                transport_public_key: transport.public_key_hex(),
                device_shard: sealed,
            })
            .await?;

        let device_wire = response
            .device_shard
            .ok_or(ProvisioningError::Incomplete("device shard"))?;
        let backup_wire = response
            .backup_shard
            .ok_or(ProvisioningError::Incomplete("backup shard"))?;

        let device_envelope = self.rewrap_device(&device_wire, &transport_key, credential)?;
        let backup = unseal(&backup_wire, ShardRole::BackupOwner, &transport_key);
        Ok(ReissuedShards {
            device_envelope,
            backup,
        })
    }

    /// Fetch shard B for a recovery session.
    pub async fn release_server_shard(
        &self,
        wallet_address: &str,
        auth: &AuthContext,
    ) -> Result<ShardSecret, ProvisioningError> {
        let mut transport = TransportSession::new();
        let response = self
            .service
            .release_server_shard(ReleaseRequest {
                wallet_address: wallet_address.to_string(),
                auth_proof: auth.proof().to_string(),
                transport_public_key: transport.public_key_hex(),
            })
            .await?;

        let wire = response
            .server_shard
            .ok_or(ProvisioningError::Incomplete("server shard"))?;
        let peer = response
            .transport_public_key
            .ok_or(ProvisioningError::Incomplete("transport public key"))?;
        let transport_key = transport.derive_key(&parse_public_key(&peer)?)?;
        unseal(&wire, ShardRole::ServerAssisted, &transport_key)
            .map_err(ProvisioningError::Envelope)
    }

    pub async fn delete_wallet(
        &self,
        wallet_address: &str,
        auth: &AuthContext,
    ) -> Result<(), ProvisioningError> {
        let response = self
            .service
            .delete_wallet(DeleteRequest {
                wallet_address: wallet_address.to_string(),
                auth_proof: auth.proof().to_string(),
            })
            .await?;
        if !response.deleted {
            // Already gone on the service side; nothing left to undo.
            debug!(address = %wallet_address, "collaborator had no wallet to delete");
        }
        Ok(())
    }

    /// The wallet the service holds for `key`, if any.
    pub async fn lookup_wallet(
        &self,
        key: &WalletKey,
        auth: &AuthContext,
    ) -> Result<Option<ExistingWallet>, ProvisioningError> {
        let response = match self
            .service
            .lookup_wallet(LookupRequest {
                user_id: key.user_id.clone(),
                chain: key.chain.clone(),
                auth_proof: auth.proof().to_string(),
            })
            .await
        {
            Ok(response) => response,
            Err(ServiceError::Rejected { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let address = response
            .wallet_address
            .ok_or(ProvisioningError::Incomplete("wallet address"))?;
        Ok(Some(ExistingWallet {
            wallet_address: normalize_address(&address)?,
            server_shard_id: response.server_shard_id,
        }))
    }

    fn rewrap_device(
        &self,
        wire: &str,
        transport_key: &[u8; AES_KEY_LENGTH],
        credential: &DeviceCredential,
    ) -> Result<ShardEnvelope, ProvisioningError> {
        let device = unseal(wire, ShardRole::Device, transport_key)
            .map_err(ProvisioningError::Envelope)?;
        let envelope = encrypt_shard(&device, credential.as_key(), &self.kdf)
            .map_err(ProvisioningError::Envelope);
        device.wipe();
        envelope
    }
}

/// Seal a shard for transport as a wire string.
pub(crate) fn seal(
    secret: &ShardSecret,
    transport_key: &Zeroizing<[u8; AES_KEY_LENGTH]>,
) -> Result<String, ProvisioningError> {
    // Raw-key envelopes ignore the KDF parameters.
    encrypt_shard(secret, ShardKey::Raw(transport_key), &KdfParams::default())
        .and_then(|env| envelope_to_wire(&env))
        .map_err(ProvisioningError::Envelope)
}

/// Open a sealed wire envelope, checking it carries the expected role.
pub(crate) fn unseal(
    wire: &str,
    role: ShardRole,
    transport_key: &[u8; AES_KEY_LENGTH],
) -> Result<ShardSecret, CodecError> {
    let envelope = envelope_from_wire(wire)?;
    if envelope.role != role {
        return Err(CodecError::Corrupted("sealed shard carries an unexpected role"));
    }
    decrypt_shard(&envelope, ShardKey::Raw(transport_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{Fault, LocalThresholdService};
    use crate::shard::combine_shards;

    fn client(service: Arc<LocalThresholdService>) -> ProvisioningClient {
        ProvisioningClient::new(service, KdfParams::insecure_fast())
    }

    fn key() -> WalletKey {
        WalletKey::new("u1", "BSC")
    }

    fn credential() -> DeviceCredential {
        DeviceCredential::passphrase("device pass")
    }

    #[tokio::test]
    async fn provision_returns_address_and_shards() {
        let service = Arc::new(LocalThresholdService::new());
        let wallet = client(service.clone())
            .provision(&key(), "req-1", &AuthContext::new("token"), &credential())
            .await
            .unwrap();

        assert!(wallet.wallet_address.starts_with("0x"));
        assert_eq!(wallet.device_envelope.role, ShardRole::Device);

        let device = decrypt_shard(&wallet.device_envelope, credential().as_key()).unwrap();
        let backup = wallet.backup.unwrap();
        assert_eq!(backup.role(), ShardRole::BackupOwner);
        let seed = combine_shards(&[&device, &backup]).unwrap();
        assert_eq!(seed.len(), 32);
    }

    #[tokio::test]
    async fn missing_field_fails_whole_response() {
        let service = Arc::new(LocalThresholdService::new());
        service.inject_fault(Fault::OmitDeviceShard);
        let err = client(service)
            .provision(&key(), "req-1", &AuthContext::new("token"), &credential())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Incomplete("device shard")));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn unreadable_backup_is_reported_not_fatal() {
        let service = Arc::new(LocalThresholdService::new());
        service.inject_fault(Fault::CorruptBackupShard);
        let wallet = client(service)
            .provision(&key(), "req-1", &AuthContext::new("token"), &credential())
            .await
            .unwrap();
        assert!(wallet.backup.is_err());
    }

    #[tokio::test]
    async fn rejected_request_is_not_retriable() {
        let service = Arc::new(LocalThresholdService::new());
        let err = client(service)
            .provision(&key(), "req-1", &AuthContext::new(""), &credential())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::Service(ServiceError::Rejected { status: 401, .. })
        ));
        assert!(!err.is_retriable());
        assert!(err.is_refusal());
    }

    #[tokio::test]
    async fn release_server_shard_unseals_role_b() {
        let service = Arc::new(LocalThresholdService::new());
        let c = client(service);
        let wallet = c
            .provision(&key(), "req-1", &AuthContext::new("token"), &credential())
            .await
            .unwrap();
        let shard = c
            .release_server_shard(&wallet.wallet_address, &AuthContext::new("token"))
            .await
            .unwrap();
        assert_eq!(shard.role(), ShardRole::ServerAssisted);
    }

    #[tokio::test]
    async fn retry_with_same_request_id_returns_same_wallet() {
        let service = Arc::new(LocalThresholdService::new());
        service.inject_fault(Fault::LoseProvisionResponse);
        let c = client(service.clone());
        let err = c
            .provision(&key(), "req-1", &AuthContext::new("token"), &credential())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert!(!err.is_refusal());

        let wallet = c
            .provision(&key(), "req-1", &AuthContext::new("token"), &credential())
            .await
            .unwrap();
        assert_eq!(service.wallet_count(), 1);
        let existing = c
            .lookup_wallet(&key(), &AuthContext::new("token"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(existing.wallet_address, wallet.wallet_address);
        assert!(wallet.backup.is_ok());
    }

    #[tokio::test]
    async fn new_request_id_for_existing_wallet_is_conflict() {
        let service = Arc::new(LocalThresholdService::new());
        let c = client(service);
        c.provision(&key(), "req-1", &AuthContext::new("token"), &credential())
            .await
            .unwrap();
        let err = c
            .provision(&key(), "req-2", &AuthContext::new("token"), &credential())
            .await
            .unwrap_err();
        assert!(err.is_already_provisioned());
        assert!(!err.is_refusal());
    }

    #[tokio::test]
    async fn lookup_of_unknown_wallet_is_none() {
        let service = Arc::new(LocalThresholdService::new());
        let found = client(service)
            .lookup_wallet(&key(), &AuthContext::new("token"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn unseal_checks_role() {
        let transport_key = Zeroizing::new([9u8; 32]);
        let secret = ShardSecret::new(ShardRole::Device, vec![1; 32]);
        let wire = seal(&secret, &transport_key).unwrap();
        assert!(unseal(&wire, ShardRole::Device, &transport_key).is_ok());
        assert!(unseal(&wire, ShardRole::BackupOwner, &transport_key)
            .unwrap_err()
            .is_corruption());
    }
}
