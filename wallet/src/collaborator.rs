//! # In-Process Reference Collaborator
//!
//! [`LocalThresholdService`] implements both collaborator contracts in
//! memory: it generates an Ed25519 seed, splits it 2-of-3 with
//! [`split_seed`], keeps shard B, and rebuilds signers from any two shards.
//! It backs the integration tests and the node's `--local-collaborator` dev
//! mode. It is not a threshold signing protocol: the seed exists briefly in
//! this process during provisioning, reissue and reconstruction.
//!
//! Provisioning is idempotent per request id: the device and backup shares
//! of a wallet are kept so a retried request can be answered again, until
//! the shares are refreshed by a reissue.
//!
//! Faults can be injected one call at a time to exercise the client's
//! failure handling.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::{AES_KEY_LENGTH, SIGNING_SEED_LENGTH};
use crate::crypto::transport::respond;
use crate::crypto::{TransportResponder, WalletKeypair};
use crate::error::CODE_ALREADY_PROVISIONED;
use crate::provisioning::client::{seal, unseal};
use crate::provisioning::{
    parse_public_key, DeleteRequest, DeleteResponse, LookupRequest, LookupResponse,
    ProvisionRequest, ProvisionResponse,
    ProvisioningService, ReissueRequest, ReissueResponse, ReleaseRequest, ReleaseResponse,
    ServiceError,
};
use crate::recovery::reconstruct::{
    ReconstructError, ReconstructRequest, ReconstructResponse, ReconstructionService,
    SessionSigner,
};
use crate::shard::{combine_shards, split_seed, ShardRole, ShardSecret};
use crate::storage::WalletKey;

/// One-shot failure to inject into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Next provisioning or reconstruction call fails as unreachable.
    Unavailable,
    /// Next provision response lacks the device shard.
    OmitDeviceShard,
    /// Next provision or reissue response carries a backup shard sealed
    /// under the wrong key.
    CorruptBackupShard,
    /// Next provision creates the wallet, then fails as unreachable.
    LoseProvisionResponse,
}

struct ServerWallet {
    key: WalletKey,
    shard_id: String,
    request_id: String,
    server_share: ShardSecret,
    /// Device and backup shares, kept for replaying the provision response.
    issued: Option<(ShardSecret, ShardSecret)>,
}

pub struct LocalThresholdService {
    responder: TransportResponder,
    wallets: DashMap<String, ServerWallet>,
    by_key: DashMap<WalletKey, String>,
    signers: DashMap<String, WalletKeypair>,
    fault: Mutex<Option<Fault>>,
}

impl Default for LocalThresholdService {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalThresholdService {
    pub fn new() -> Self {
        Self {
            responder: TransportResponder::generate(),
            wallets: DashMap::new(),
            by_key: DashMap::new(),
            signers: DashMap::new(),
            fault: Mutex::new(None),
        }
    }

    pub fn inject_fault(&self, fault: Fault) {
        *self.fault.lock() = Some(fault);
    }

    pub fn wallet_count(&self) -> usize {
        self.wallets.len()
    }

    /// Sign with a signer produced by a successful reconstruction.
    pub fn sign(&self, signer_id: &str, message: &[u8]) -> Option<[u8; 64]> {
        self.signers.get(signer_id).map(|kp| kp.sign(message))
    }

    fn take_fault(&self, applies: impl Fn(Fault) -> bool) -> Option<Fault> {
        let mut slot = self.fault.lock();
        match *slot {
            Some(fault) if applies(fault) => slot.take(),
            _ => None,
        }
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        match self.take_fault(|f| f == Fault::Unavailable) {
            Some(_) => Err(ServiceError::Unavailable("injected outage".into())),
            None => Ok(()),
        }
    }

    fn check_auth(proof: &str) -> Result<(), ServiceError> {
        if proof.trim().is_empty() {
            return Err(ServiceError::rejected(401, "unauthenticated", "missing auth proof"));
        }
        Ok(())
    }

    fn client_key(hex_key: &str) -> Result<[u8; 32], ServiceError> {
        parse_public_key(hex_key)
            .map_err(|e| ServiceError::rejected(400, "bad_request", e.to_string()))
    }

    fn seal_for(
        secret: &ShardSecret,
        key: &Zeroizing<[u8; AES_KEY_LENGTH]>,
    ) -> Result<String, ServiceError> {
        seal(secret, key).map_err(|e| ServiceError::Unavailable(format!("internal: {e}")))
    }

    /// Seal the backup shard, or seal it under a throwaway key when a
    /// corrupt delivery was injected.
    fn seal_backup(
        &self,
        secret: &ShardSecret,
        key: &Zeroizing<[u8; AES_KEY_LENGTH]>,
    ) -> Result<String, ServiceError> {
        if self.take_fault(|f| f == Fault::CorruptBackupShard).is_some() {
            let mut wrong = Zeroizing::new([0u8; AES_KEY_LENGTH]);
            OsRng.fill_bytes(&mut wrong[..]);
            return Self::seal_for(secret, &wrong);
        }
        Self::seal_for(secret, key)
    }

    /// Split a seed and pull the three role shares out in A, B, C order.
    fn split(seed: &[u8]) -> Result<(ShardSecret, ShardSecret, ShardSecret), ServiceError> {
        let mut shares = split_seed(seed)
            .map_err(|e| ServiceError::Unavailable(format!("internal: {e}")))?
            .into_iter();
        match (shares.next(), shares.next(), shares.next()) {
            (Some(a), Some(b), Some(c)) => Ok((a, b, c)),
            _ => Err(ServiceError::Unavailable("internal: short split".into())),
        }
    }

    fn wallet_not_found() -> ServiceError {
        ServiceError::rejected(404, "wallet_not_found", "unknown wallet")
    }

    fn copy_share(share: &ShardSecret) -> ShardSecret {
        ShardSecret::new(share.role(), share.expose().to_vec())
    }

    /// Seal the device and backup shares for a client and build the
    /// provision response.
    fn deliver(
        &self,
        client_public: &[u8; 32],
        device: &ShardSecret,
        backup: &ShardSecret,
        address: &str,
        shard_id: &str,
    ) -> Result<ProvisionResponse, ServiceError> {
        let (our_public, transport_key) = respond(client_public)
            .map_err(|e| ServiceError::rejected(400, "bad_request", e.to_string()))?;
        let device_shard = match self.take_fault(|f| f == Fault::OmitDeviceShard) {
            Some(_) => None,
            None => Some(Self::seal_for(device, &transport_key)?),
        };
        let backup_shard = self.seal_backup(backup, &transport_key)?;

        Ok(ProvisionResponse {
            wallet_address: Some(address.to_string()),
            device_shard,
            backup_shard: Some(backup_shard),
            server_shard_id: Some(shard_id.to_string()),
            transport_public_key: Some(hex::encode(our_public)),
        })
    }

    /// Answer a repeated provision request for an existing wallet.
    fn replay(
        &self,
        address: &str,
        request: &ProvisionRequest,
        client_public: &[u8; 32],
    ) -> Result<ProvisionResponse, ServiceError> {
        let conflict = || {
            ServiceError::rejected(
                409,
                CODE_ALREADY_PROVISIONED,
                format!("wallet exists for {}/{}", request.user_id, request.chain),
            )
        };
        let wallet = self.wallets.get(address).ok_or_else(conflict)?;
        if wallet.request_id != request.request_id {
            return Err(conflict());
        }
        let Some((device, backup)) = &wallet.issued else {
            return Err(conflict());
        };
        info!(wallet = %wallet.key, %address, "local collaborator replayed provisioning");
        self.deliver(client_public, device, backup, address, &wallet.shard_id)
    }
}

#[async_trait]
impl ProvisioningService for LocalThresholdService {
    async fn transport_key(&self) -> Result<[u8; 32], ServiceError> {
        Ok(self.responder.public_key_bytes())
    }

    async fn provision(
        &self,
        request: ProvisionRequest,
    ) -> Result<ProvisionResponse, ServiceError> {
        self.check_available()?;
        Self::check_auth(&request.auth_proof)?;
        let client_public = Self::client_key(&request.transport_public_key)?;
        let key = WalletKey::new(request.user_id.clone(), &request.chain);
        let existing = self.by_key.get(&key).map(|entry| entry.value().clone());
        if let Some(address) = existing {
            return self.replay(&address, &request, &client_public);
        }

        let mut seed = Zeroizing::new([0u8; SIGNING_SEED_LENGTH]);
        OsRng.fill_bytes(&mut seed[..]);
        let address = WalletKeypair::from_seed(&seed).address();
        let (device, server, backup) = Self::split(&seed[..])?;
        drop(seed);

        let shard_id = Uuid::new_v4().to_string();
        let response = self.deliver(&client_public, &device, &backup, &address, &shard_id)?;
        self.wallets.insert(
            address.clone(),
            ServerWallet {
                key: key.clone(),
                shard_id,
                request_id: request.request_id,
                server_share: server,
                issued: Some((device, backup)),
            },
        );
        self.by_key.insert(key.clone(), address.clone());
        info!(wallet = %key, %address, "local collaborator provisioned wallet");

        if self.take_fault(|f| f == Fault::LoseProvisionResponse).is_some() {
            return Err(ServiceError::Unavailable("response lost".into()));
        }
        Ok(response)
    }

    async fn reissue_backup(
        &self,
        request: ReissueRequest,
    ) -> Result<ReissueResponse, ServiceError> {
        self.check_available()?;
        Self::check_auth(&request.auth_proof)?;
        let key = WalletKey::new(request.user_id, &request.chain);
        let mut wallet = self
            .wallets
            .get_mut(&request.wallet_address)
            .ok_or_else(Self::wallet_not_found)?;
        if wallet.key != key {
            return Err(Self::wallet_not_found());
        }

        let client_public = Self::client_key(&request.transport_public_key)?;
        let transport_key = self
            .responder
            .derive_key(&client_public)
            .map_err(|e| ServiceError::rejected(400, "bad_request", e.to_string()))?;
        let device = unseal(&request.device_shard, ShardRole::Device, &transport_key)
            .map_err(|e| ServiceError::rejected(422, "invalid_shard", e.to_string()))?;

        let seed = combine_shards(&[&device, &wallet.server_share])
            .map_err(|e| ServiceError::rejected(422, "invalid_shard", e.to_string()))?;
        device.wipe();
        let seed: Zeroizing<[u8; SIGNING_SEED_LENGTH]> = Zeroizing::new(
            seed.as_slice()
                .try_into()
                .map_err(|_| ServiceError::rejected(422, "invalid_shard", "bad seed length"))?,
        );
        if WalletKeypair::from_seed(&seed).address() != request.wallet_address {
            return Err(ServiceError::rejected(
                422,
                "invalid_shard",
                "device shard does not belong to this wallet",
            ));
        }

        // Fresh polynomial: every previously issued share stops combining
        // with the new ones.
        let (device, server, backup) = Self::split(&seed[..])?;
        drop(seed);
        wallet.server_share = server;
        wallet.issued = None;
        info!(wallet = %key, "local collaborator refreshed shares");

        Ok(ReissueResponse {
            device_shard: Some(Self::seal_for(&device, &transport_key)?),
            backup_shard: Some(self.seal_backup(&backup, &transport_key)?),
        })
    }

    async fn release_server_shard(
        &self,
        request: ReleaseRequest,
    ) -> Result<ReleaseResponse, ServiceError> {
        self.check_available()?;
        Self::check_auth(&request.auth_proof)?;
        let wallet = self
            .wallets
            .get(&request.wallet_address)
            .ok_or_else(Self::wallet_not_found)?;
        let client_public = Self::client_key(&request.transport_public_key)?;
        let (our_public, transport_key) = respond(&client_public)
            .map_err(|e| ServiceError::rejected(400, "bad_request", e.to_string()))?;

        let copy = Self::copy_share(&wallet.server_share);
        let sealed = Self::seal_for(&copy, &transport_key)?;
        copy.wipe();
        debug!(wallet = %wallet.key, shard_id = %wallet.shard_id, "server shard released");

        Ok(ReleaseResponse {
            server_shard: Some(sealed),
            transport_public_key: Some(hex::encode(our_public)),
        })
    }

    async fn delete_wallet(&self, request: DeleteRequest) -> Result<DeleteResponse, ServiceError> {
        self.check_available()?;
        Self::check_auth(&request.auth_proof)?;
        let removed = self.wallets.remove(&request.wallet_address);
        if let Some((_, wallet)) = &removed {
            self.by_key.remove(&wallet.key);
        }
        Ok(DeleteResponse {
            deleted: removed.is_some(),
        })
    }

    async fn lookup_wallet(&self, request: LookupRequest) -> Result<LookupResponse, ServiceError> {
        self.check_available()?;
        Self::check_auth(&request.auth_proof)?;
        let key = WalletKey::new(request.user_id, &request.chain);
        let address = self
            .by_key
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(Self::wallet_not_found)?;
        let wallet = self
            .wallets
            .get(&address)
            .ok_or_else(Self::wallet_not_found)?;
        Ok(LookupResponse {
            wallet_address: Some(address),
            server_shard_id: Some(wallet.shard_id.clone()),
        })
    }
}

#[async_trait]
impl ReconstructionService for LocalThresholdService {
    async fn transport_key(&self) -> Result<[u8; 32], ServiceError> {
        Ok(self.responder.public_key_bytes())
    }

    async fn reconstruct(
        &self,
        request: ReconstructRequest,
    ) -> Result<ReconstructResponse, ReconstructError> {
        self.check_available()?;
        let client_public = Self::client_key(&request.transport_public_key)?;
        let transport_key = self
            .responder
            .derive_key(&client_public)
            .map_err(|e| ReconstructError::InvalidShard(e.to_string()))?;

        let mut shards = Vec::with_capacity(request.shards.len());
        for sealed in &request.shards {
            let shard = unseal(&sealed.material, sealed.role, &transport_key)
                .map_err(|e| ReconstructError::InvalidShard(format!("{}: {e}", sealed.role)))?;
            if shards.iter().any(|s: &ShardSecret| s.role() == shard.role()) {
                return Err(ReconstructError::InvalidShard(format!(
                    "duplicate {} shard",
                    shard.role()
                )));
            }
            shards.push(shard);
        }
        if shards.len() < 2 {
            return Err(ReconstructError::InsufficientShards { got: shards.len() });
        }

        let refs: Vec<&ShardSecret> = shards.iter().collect();
        let seed = combine_shards(&refs).map_err(|e| ReconstructError::InvalidShard(e.to_string()))?;
        let seed: Zeroizing<[u8; SIGNING_SEED_LENGTH]> = Zeroizing::new(
            seed.as_slice()
                .try_into()
                .map_err(|_| ReconstructError::InvalidShard("shards have the wrong length".into()))?,
        );
        let keypair = WalletKeypair::from_seed(&seed);
        drop(seed);

        let derived_address = keypair.address();
        if derived_address != request.wallet_address {
            return Err(ReconstructError::AddressMismatch {
                derived: derived_address,
            });
        }

        let signer = SessionSigner {
            signer_id: Uuid::new_v4().to_string(),
            public_key: hex::encode(keypair.public_key_bytes()),
        };
        self.signers.insert(signer.signer_id.clone(), keypair);
        info!(address = %derived_address, signer = %signer.signer_id, "signer reconstructed");

        Ok(ReconstructResponse {
            derived_address,
            session_signer: signer,
        })
    }
}
