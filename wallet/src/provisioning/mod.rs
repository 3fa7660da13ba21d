//! # Wallet Provisioning
//!
//! ```text
//! mod.rs   : ProvisioningService contract, wire types, ServiceError
//! client.rs: ProvisioningClient: atomic provisioning, transport unsealing
//! http.rs  : reqwest implementation of the contract
//! ```
//!
//! The provisioning service runs the distributed key generation and holds
//! shard B. Shards it hands back are codec envelopes sealed under a
//! per-request transport key (see [`crate::crypto::transport`]); a response
//! is all-or-nothing: a missing field fails the whole call.

pub mod client;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

pub use client::{
    ExistingWallet, ProvisionedWallet, ProvisioningClient, ProvisioningError, ReissuedShards,
};
pub use http::{HttpCollaborator, HttpProvisioningService};

/// Failure talking to a remote collaborator.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// 4xx: the collaborator understood and refused the request.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        status: u16,
        /// Machine-readable error code from the response body, if any.
        code: Option<String>,
        message: String,
    },

    /// 5xx, timeout or connection failure. Safe to retry after a state check.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered with something we cannot decode.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_))
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ServiceError::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn rejected(status: u16, code: &str, message: impl Into<String>) -> Self {
        ServiceError::Rejected {
            status,
            code: Some(code.to_string()),
            message: message.into(),
        }
    }
}

/// Proof that the caller is authenticated as the user (session token,
/// social-login assertion). Opaque to this crate and never logged.
#[derive(Clone)]
pub struct AuthContext {
    proof: Zeroizing<String>,
}

impl AuthContext {
    pub fn new(proof: impl Into<String>) -> Self {
        Self {
            proof: Zeroizing::new(proof.into()),
        }
    }

    pub fn proof(&self) -> &str {
        &self.proof
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthContext(***)")
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// `POST /provision`. The collaborator answers with its own ephemeral key.
///
/// `request_id` makes the call idempotent: repeating it for the same
/// `(user_id, chain)` returns the wallet created by the first attempt,
/// sealed under the new transport key. A different id for a provisioned
/// pair is answered with 409 `already_provisioned`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub user_id: String,
    pub chain: String,
    pub request_id: String,
    pub auth_proof: String,
    pub transport_public_key: String,
}

/// Every field is optional on the wire so that a partial response can be
/// detected and rejected as a whole.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionResponse {
    pub wallet_address: Option<String>,
    /// Sealed Device envelope.
    pub device_shard: Option<String>,
    /// Sealed BackupOwner envelope, shown once.
    pub backup_shard: Option<String>,
    pub server_shard_id: Option<String>,
    pub transport_public_key: Option<String>,
}

/// `POST /backup/reissue`. Carries the current Device shard sealed to the
/// collaborator's static transport key; the answer is sealed under the same
/// key. Refreshes all shares, so the previous backup shard stops working.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReissueRequest {
    pub user_id: String,
    pub chain: String,
    pub wallet_address: String,
    pub auth_proof: String,
    pub transport_public_key: String,
    pub device_shard: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReissueResponse {
    pub device_shard: Option<String>,
    pub backup_shard: Option<String>,
}

/// `POST /server-shard/release`. Re-verifies the user and releases shard B
/// for a recovery session.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub wallet_address: String,
    pub auth_proof: String,
    pub transport_public_key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseResponse {
    pub server_shard: Option<String>,
    pub transport_public_key: Option<String>,
}

/// `POST /wallets/delete`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub wallet_address: String,
    pub auth_proof: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// `POST /wallets/lookup`. Finds the wallet the service holds for a user
/// and chain; 404 when there is none.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupRequest {
    pub user_id: String,
    pub chain: String,
    pub auth_proof: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LookupResponse {
    pub wallet_address: Option<String>,
    pub server_shard_id: Option<String>,
}

/// `GET /transport-key`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportKeyResponse {
    pub public_key: String,
}

/// Contract of the remote key-generation collaborator.
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    /// Static X25519 key that shards sent to this service are sealed to.
    async fn transport_key(&self) -> Result<[u8; 32], ServiceError>;

    async fn provision(&self, request: ProvisionRequest)
        -> Result<ProvisionResponse, ServiceError>;

    async fn reissue_backup(&self, request: ReissueRequest)
        -> Result<ReissueResponse, ServiceError>;

    async fn release_server_shard(
        &self,
        request: ReleaseRequest,
    ) -> Result<ReleaseResponse, ServiceError>;

    async fn delete_wallet(&self, request: DeleteRequest) -> Result<DeleteResponse, ServiceError>;

    async fn lookup_wallet(&self, request: LookupRequest) -> Result<LookupResponse, ServiceError>;
}

/// Parse a hex-encoded 32-byte public key from a wire field.
pub(crate) fn parse_public_key(hex_key: &str) -> Result<[u8; 32], ServiceError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|_| ServiceError::Malformed("transport key is not hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| ServiceError::Malformed("transport key must be 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retriable() {
        assert!(ServiceError::Unavailable("timeout".into()).is_retriable());
        assert!(!ServiceError::Malformed("x".into()).is_retriable());
        assert!(!ServiceError::rejected(409, "conflict", "dup").is_retriable());
    }

    #[test]
    fn partial_response_deserializes_with_gaps() {
        let resp: ProvisionResponse =
            serde_json::from_str(r#"{"walletAddress":"0xabc"}"#).unwrap();
        assert_eq!(resp.wallet_address.as_deref(), Some("0xabc"));
        assert!(resp.device_shard.is_none());
        assert!(resp.backup_shard.is_none());
    }

    #[test]
    fn auth_context_debug_redacts() {
        let auth = AuthContext::new("secret-token");
        assert!(!format!("{:?}", auth).contains("secret-token"));
        assert_eq!(auth.proof(), "secret-token");
    }

    #[test]
    fn public_key_parsing() {
        let hex_key = hex::encode([3u8; 32]);
        assert_eq!(parse_public_key(&hex_key).unwrap(), [3u8; 32]);
        assert!(parse_public_key("zz").is_err());
        assert!(parse_public_key(&hex::encode([1u8; 8])).is_err());
    }
}
