//! Threshold Reconstruction Service contract.
//!
//! The client seals each staged shard to the service's static transport key
//! and asks it to rebuild signing capability for a wallet address. The
//! service answers with the address it derived and a handle on the signer
//! it now holds, or one of three session-scoped refusals.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::provisioning::{
    parse_public_key, HttpCollaborator, ServiceError, TransportKeyResponse,
};
use crate::shard::ShardRole;

#[derive(Debug, Clone, Error)]
pub enum ReconstructError {
    #[error("reconstruction needs at least two distinct shards, got {got}")]
    InsufficientShards { got: usize },

    #[error("shard rejected by reconstruction service: {0}")]
    InvalidShard(String),

    #[error("shards reconstruct a different wallet ({derived})")]
    AddressMismatch { derived: String },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Error codes carried in 4xx bodies.
pub const CODE_INSUFFICIENT_SHARDS: &str = "insufficient_shards";
pub const CODE_INVALID_SHARD: &str = "invalid_shard";
pub const CODE_ADDRESS_MISMATCH: &str = "address_mismatch";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedShard {
    pub role: ShardRole,
    /// Wire envelope under the request's transport key.
    pub material: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructRequest {
    pub wallet_address: String,
    pub transport_public_key: String,
    pub shards: Vec<SealedShard>,
}

/// Handle on signing capability held by the reconstruction service. Carries
/// no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSigner {
    pub signer_id: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructResponse {
    pub derived_address: String,
    pub session_signer: SessionSigner,
}

#[async_trait]
pub trait ReconstructionService: Send + Sync {
    /// Static X25519 key that staged shards are sealed to.
    async fn transport_key(&self) -> Result<[u8; 32], ServiceError>;

    async fn reconstruct(
        &self,
        request: ReconstructRequest,
    ) -> Result<ReconstructResponse, ReconstructError>;
}

/// [`ReconstructionService`] reached over HTTP.
#[derive(Clone)]
pub struct HttpReconstructionService {
    http: HttpCollaborator,
}

impl HttpReconstructionService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            http: HttpCollaborator::new(base_url, timeout)?,
        })
    }
}

/// Lift a 4xx with a known code into the matching refusal.
pub(crate) fn classify(error: ServiceError) -> ReconstructError {
    match error.code() {
        Some(CODE_INSUFFICIENT_SHARDS) => ReconstructError::InsufficientShards { got: 0 },
        Some(CODE_INVALID_SHARD) => ReconstructError::InvalidShard(error.to_string()),
        Some(CODE_ADDRESS_MISMATCH) => {
            let derived = match &error {
                ServiceError::Rejected { message, .. } => message.clone(),
                _ => String::new(),
            };
            ReconstructError::AddressMismatch { derived }
        }
        _ => ReconstructError::Service(error),
    }
}

#[async_trait]
impl ReconstructionService for HttpReconstructionService {
    async fn transport_key(&self) -> Result<[u8; 32], ServiceError> {
        let response: TransportKeyResponse = self.http.get("/transport-key").await?;
        parse_public_key(&response.public_key)
    }

    async fn reconstruct(
        &self,
        request: ReconstructRequest,
    ) -> Result<ReconstructResponse, ReconstructError> {
        self.http
            .post("/reconstruct", &request)
            .await
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_are_classified() {
        assert!(matches!(
            classify(ServiceError::rejected(422, CODE_INSUFFICIENT_SHARDS, "one shard")),
            ReconstructError::InsufficientShards { .. }
        ));
        assert!(matches!(
            classify(ServiceError::rejected(422, CODE_INVALID_SHARD, "bad")),
            ReconstructError::InvalidShard(_)
        ));
        match classify(ServiceError::rejected(409, CODE_ADDRESS_MISMATCH, "0xdead")) {
            ReconstructError::AddressMismatch { derived } => assert_eq!(derived, "0xdead"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn other_failures_stay_service_errors() {
        assert!(matches!(
            classify(ServiceError::Unavailable("503".into())),
            ReconstructError::Service(ServiceError::Unavailable(_))
        ));
        assert!(matches!(
            classify(ServiceError::rejected(400, "bad_request", "x")),
            ReconstructError::Service(ServiceError::Rejected { .. })
        ));
    }

    #[test]
    fn request_uses_camel_case() {
        let req = ReconstructRequest {
            wallet_address: "0x1".into(),
            transport_public_key: "aa".into(),
            shards: vec![SealedShard {
                role: ShardRole::BackupOwner,
                material: "bb".into(),
            }],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["walletAddress"], "0x1");
        assert_eq!(json["shards"][0]["role"], "backup_owner");
    }
}
