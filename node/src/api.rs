//! # REST API
//!
//! Builds the axum router that puts the wallet facade in front of a UI
//! layer. All endpoints share application state through axum's `State`
//! extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                                   | Description                       |
//! |--------|----------------------------------------|-----------------------------------|
//! | GET    | `/health`                              | Liveness check                    |
//! | GET    | `/metrics`                             | Prometheus metrics                |
//! | POST   | `/wallets`                             | Create (or ensure) a wallet       |
//! | GET    | `/wallets/:user`                       | All wallets of a user             |
//! | GET    | `/wallets/:user/:chain`                | Wallet state                      |
//! | DELETE | `/wallets/:user/:chain`                | Delete a wallet                   |
//! | GET    | `/wallets/:user/:chain/audit`          | Audit log                         |
//! | POST   | `/wallets/:user/:chain/backup/export`  | Show the backup shard, once       |
//! | POST   | `/wallets/:user/:chain/backup/ack`     | Confirm the backup was stored     |
//! | POST   | `/wallets/:user/:chain/backup/regenerate` | Reissue the backup shard       |
//! | POST   | `/wallets/:user/:chain/credential`     | Change the device credential      |
//! | POST   | `/wallets/:user/:chain/deauthorize`    | Drop this device's shard          |
//! | POST   | `/wallets/:user/:chain/lock`           | Lock the wallet                   |
//! | POST   | `/wallets/:user/:chain/unlock`         | Unlock with the device credential |
//! | POST   | `/recovery`                            | Begin recovery                    |
//! | GET    | `/recovery/:session`                   | Recovery session                  |
//! | DELETE | `/recovery/:session`                   | Cancel recovery                   |
//! | POST   | `/recovery/:session/shards`            | Submit a shard                    |
//! | POST   | `/recovery/:session/resume`            | Retry reconstruction              |
//!
//! Calls that reach a collaborator take the user's proof as
//! `Authorization: Bearer <proof>`.

use axum::{
    extract::{FromRef, Path, State},
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use trishard_wallet::backup::BackupAcknowledgement;
use trishard_wallet::config::AES_KEY_LENGTH;
use trishard_wallet::provisioning::AuthContext;
use trishard_wallet::recovery::{
    RecoveryProgress, RecoverySession, SessionSigner, SessionState, ShardMaterial,
};
use trishard_wallet::shard::{DeviceCredential, ShardRole};
use trishard_wallet::storage::AuditEntry;
use trishard_wallet::{Remediation, WalletError, WalletResult, WalletSession, WalletState};

use crate::metrics::{metrics_handler, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone, everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub wallets: Arc<WalletSession>,
    pub metrics: SharedMetrics,
    /// The node's reported version string.
    pub version: String,
}

impl FromRef<AppState> for SharedMetrics {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.metrics)
    }
}

impl AppState {
    /// Convert a facade result, counting failures the metrics care about.
    fn track<T>(&self, result: WalletResult<T>) -> Result<T, ApiError> {
        result.map_err(|e| {
            self.metrics.record_error(&e);
            ApiError::Wallet(e)
        })
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/wallets", post(create_wallet_handler))
        .route("/wallets/:user", get(list_wallets_handler))
        .route(
            "/wallets/:user/:chain",
            get(wallet_state_handler).delete(delete_wallet_handler),
        )
        .route("/wallets/:user/:chain/audit", get(audit_handler))
        .route("/wallets/:user/:chain/backup/export", post(export_backup_handler))
        .route("/wallets/:user/:chain/backup/ack", post(acknowledge_backup_handler))
        .route(
            "/wallets/:user/:chain/backup/regenerate",
            post(regenerate_backup_handler),
        )
        .route("/wallets/:user/:chain/credential", post(change_credential_handler))
        .route("/wallets/:user/:chain/deauthorize", post(deauthorize_handler))
        .route("/wallets/:user/:chain/lock", post(lock_handler))
        .route("/wallets/:user/:chain/unlock", post(unlock_handler))
        .route("/recovery", post(begin_recovery_handler))
        .route(
            "/recovery/:session",
            get(recovery_session_handler).delete(cancel_recovery_handler),
        )
        .route("/recovery/:session/shards", post(submit_shard_handler))
        .route("/recovery/:session/resume", post(resume_recovery_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// A device credential as sent by the UI. Exactly one form.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialBody {
    Passphrase(String),
    /// Hex-encoded 32-byte key from platform secure storage.
    DeviceKey(String),
}

impl CredentialBody {
    fn into_credential(self) -> Result<DeviceCredential, ApiError> {
        match self {
            CredentialBody::Passphrase(p) if p.is_empty() => Err(ApiError::Wallet(
                WalletError::InvalidInput("passphrase must not be empty".into()),
            )),
            CredentialBody::Passphrase(p) => Ok(DeviceCredential::passphrase(p)),
            CredentialBody::DeviceKey(hex_key) => {
                let key: [u8; AES_KEY_LENGTH] = hex::decode(hex_key.trim())
                    .ok()
                    .and_then(|bytes| bytes.try_into().ok())
                    .ok_or_else(|| {
                        ApiError::Wallet(WalletError::InvalidInput(format!(
                            "device key must be {AES_KEY_LENGTH} hex-encoded bytes"
                        )))
                    })?;
                Ok(DeviceCredential::device_key(key))
            }
        }
    }
}

#[derive(Deserialize)]
pub struct CreateWalletRequest {
    pub user_id: String,
    pub chain: String,
    pub credential: CredentialBody,
    /// Return the existing wallet instead of failing with a conflict.
    #[serde(default)]
    pub ensure: bool,
}

#[derive(Deserialize)]
pub struct CredentialRequest {
    pub credential: CredentialBody,
}

#[derive(Deserialize)]
pub struct ChangeCredentialRequest {
    pub current: CredentialBody,
    pub new: CredentialBody,
}

#[derive(Debug, Deserialize)]
pub struct DeleteWalletRequest {
    /// Must echo the wallet address.
    pub confirmation: String,
}

#[derive(Deserialize)]
pub struct BeginRecoveryRequest {
    pub user_id: String,
    pub chain: String,
    /// Protects the Device shard written when recovery completes.
    pub credential: CredentialBody,
}

/// One shard for a recovery session, by where it comes from.
#[derive(Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ShardSubmission {
    /// The printed backup (`tsc1…`).
    RecoveryCode { code: String },
    /// This device's vaulted shard.
    Device { credential: CredentialBody },
    /// Ask the provisioning service to release its shard.
    Server,
}

/// Response payload for `POST /wallets/:user/:chain/backup/export`.
#[derive(Serialize)]
pub struct BackupExportResponse {
    pub wallet_address: String,
    pub chain: String,
    pub generation: u32,
    pub recovery_code: String,
    pub file_name: String,
    pub file_contents: String,
}

#[derive(Debug, Serialize)]
pub struct RecoveryProgressResponse {
    pub session: RecoverySession,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<SessionSigner>,
}

impl From<RecoveryProgress> for RecoveryProgressResponse {
    fn from(progress: RecoveryProgress) -> Self {
        Self {
            session: progress.session,
            signer: progress.signer,
        }
    }
}

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code.
    pub error: &'static str,
    pub message: String,
    pub remediation: Remediation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Wallet(WalletError),
    /// No bearer proof on a call that needs one.
    Unauthenticated,
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        ApiError::Wallet(e)
    }
}

fn status_for(error: &WalletError) -> StatusCode {
    use WalletError::*;
    match error {
        InvalidInput(_) | ConfirmationMismatch | CredentialRequired => StatusCode::BAD_REQUEST,
        Decryption { .. } => StatusCode::UNAUTHORIZED,
        WalletNotFound(_) | SessionNotFound(_) | DeviceShardMissing(_) => StatusCode::NOT_FOUND,
        DuplicateWallet(_)
        | InvalidState { .. }
        | SessionClosed { .. }
        | DuplicateShardRole(_)
        | TooManyFailedAttempts => StatusCode::CONFLICT,
        BackupUnavailable => StatusCode::GONE,
        Corruption(_) | InsufficientShards { .. } | InvalidShard { .. } | AddressMismatch { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Provisioning {
            retriable: true, ..
        }
        | ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Provisioning { .. }
        | ProvisioningUnresolved(_)
        | BackupDelivery { .. }
        | Rejected { .. } => StatusCode::BAD_GATEWAY,
        Storage(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    error: "unauthenticated",
                    message: "missing bearer proof".into(),
                    remediation: Remediation::Reprompt,
                    attempts_remaining: None,
                },
            ),
            ApiError::Wallet(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    tracing::error!(code = e.code(), "request failed: {}", e);
                } else {
                    tracing::debug!(code = e.code(), "request rejected: {}", e);
                }
                let attempts_remaining = match &e {
                    WalletError::Decryption { attempts_remaining }
                    | WalletError::InvalidShard {
                        attempts_remaining, ..
                    } => *attempts_remaining,
                    _ => None,
                };
                (
                    status,
                    ErrorResponse {
                        error: e.code(),
                        message: e.to_string(),
                        remediation: e.remediation(),
                        attempts_remaining,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn auth_context(headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|proof| !proof.is_empty())
        .map(AuthContext::new)
        .ok_or(ApiError::Unauthenticated)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` returns 200 while the process is serving.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `POST /wallets`
async fn create_wallet_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateWalletRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = auth_context(&headers)?;
    let credential = req.credential.into_credential()?;

    let timer = state.metrics.timer("create_wallet");
    let existed = matches!(
        state.wallets.get_wallet_state(&req.user_id, &req.chain).await,
        Ok(ref w) if w.wallet_address.is_some()
    );
    let result = if req.ensure {
        state
            .wallets
            .ensure_wallet(&req.user_id, &req.chain, &auth, &credential)
            .await
    } else {
        state
            .wallets
            .create_wallet(&req.user_id, &req.chain, &auth, &credential)
            .await
    };
    timer.observe();

    if let Err(WalletError::Provisioning { .. } | WalletError::BackupDelivery { .. }) = &result {
        state.metrics.provisioning_failures_total.inc();
    }
    let wallet = state.track(result)?;
    if existed {
        return Ok((StatusCode::OK, Json(wallet)));
    }
    state.metrics.wallets_created_total.inc();
    Ok((StatusCode::CREATED, Json(wallet)))
}

/// `GET /wallets/:user`
async fn list_wallets_handler(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<Vec<WalletState>>, ApiError> {
    Ok(Json(state.track(state.wallets.wallets_for_user(&user).await)?))
}

/// `GET /wallets/:user/:chain`
async fn wallet_state_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
) -> Result<Json<WalletState>, ApiError> {
    Ok(Json(state.track(state.wallets.get_wallet_state(&user, &chain).await)?))
}

/// `DELETE /wallets/:user/:chain`
async fn delete_wallet_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<DeleteWalletRequest>,
) -> Result<StatusCode, ApiError> {
    let auth = auth_context(&headers)?;
    state.track(
        state
            .wallets
            .delete_wallet(&user, &chain, &req.confirmation, &auth)
            .await,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /wallets/:user/:chain/audit`
async fn audit_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    Ok(Json(state.track(state.wallets.audit_log(&user, &chain))?))
}

/// `POST /wallets/:user/:chain/backup/export`
///
/// Succeeds once per issued backup. Later calls get 410.
async fn export_backup_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
) -> Result<Json<BackupExportResponse>, ApiError> {
    let artifact = state.track(state.wallets.export_backup(&user, &chain).await)?;
    state.metrics.backups_exported_total.inc();
    Ok(Json(BackupExportResponse {
        recovery_code: artifact.display_text.to_string(),
        file_contents: String::from_utf8_lossy(&artifact.file_contents).into_owned(),
        wallet_address: artifact.wallet_address,
        chain: artifact.chain,
        generation: artifact.generation,
        file_name: artifact.file_name,
    }))
}

/// `POST /wallets/:user/:chain/backup/ack`
async fn acknowledge_backup_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
) -> Result<Json<BackupAcknowledgement>, ApiError> {
    Ok(Json(state.track(state.wallets.acknowledge_backup(&user, &chain).await)?))
}

/// `POST /wallets/:user/:chain/backup/regenerate`
async fn regenerate_backup_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<CredentialRequest>,
) -> Result<Json<WalletState>, ApiError> {
    let auth = auth_context(&headers)?;
    let credential = req.credential.into_credential()?;
    let timer = state.metrics.timer("regenerate_backup");
    let result = state
        .wallets
        .regenerate_backup(&user, &chain, &auth, &credential)
        .await;
    timer.observe();
    Ok(Json(state.track(result)?))
}

/// `POST /wallets/:user/:chain/credential`
async fn change_credential_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
    Json(req): Json<ChangeCredentialRequest>,
) -> Result<Json<WalletState>, ApiError> {
    let current = req.current.into_credential()?;
    let new = req.new.into_credential()?;
    Ok(Json(state.track(
        state
            .wallets
            .change_device_credential(&user, &chain, &current, &new)
            .await,
    )?))
}

/// `POST /wallets/:user/:chain/deauthorize`
async fn deauthorize_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
) -> Result<Json<WalletState>, ApiError> {
    Ok(Json(state.track(state.wallets.deauthorize_device(&user, &chain).await)?))
}

/// `POST /wallets/:user/:chain/lock`
async fn lock_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
) -> Result<Json<WalletState>, ApiError> {
    Ok(Json(state.track(state.wallets.lock_wallet(&user, &chain).await)?))
}

/// `POST /wallets/:user/:chain/unlock`
async fn unlock_handler(
    State(state): State<AppState>,
    Path((user, chain)): Path<(String, String)>,
    Json(req): Json<CredentialRequest>,
) -> Result<Json<WalletState>, ApiError> {
    let credential = req.credential.into_credential()?;
    Ok(Json(state.track(
        state.wallets.unlock_wallet(&user, &chain, &credential).await,
    )?))
}

/// `POST /recovery`
///
/// Returns the open session if there is one (200), otherwise opens a new
/// one (201).
async fn begin_recovery_handler(
    State(state): State<AppState>,
    Json(req): Json<BeginRecoveryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let credential = req.credential.into_credential()?;
    let open_before = state
        .wallets
        .get_wallet_state(&req.user_id, &req.chain)
        .await
        .ok()
        .and_then(|w| w.recovery_session)
        .filter(|s| s.is_open())
        .map(|s| s.session_id);

    let session = state.track(
        state
            .wallets
            .begin_recovery(&req.user_id, &req.chain, credential)
            .await,
    )?;
    if open_before.as_deref() == Some(session.session_id.as_str()) {
        return Ok((StatusCode::OK, Json(session)));
    }
    state.metrics.recovery_sessions_started_total.inc();
    Ok((StatusCode::CREATED, Json(session)))
}

/// `GET /recovery/:session`
async fn recovery_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RecoverySession>, ApiError> {
    Ok(Json(state.track(state.wallets.recovery_session(&session_id).await)?))
}

/// `DELETE /recovery/:session`
async fn cancel_recovery_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RecoverySession>, ApiError> {
    let session = state.track(state.wallets.cancel_recovery(&session_id).await)?;
    state.metrics.recovery_sessions_failed_total.inc();
    Ok(Json(session))
}

/// `POST /recovery/:session/shards`
async fn submit_shard_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(submission): Json<ShardSubmission>,
) -> Result<Json<RecoveryProgressResponse>, ApiError> {
    let timer = state.metrics.timer("submit_shard");
    let result = match submission {
        ShardSubmission::RecoveryCode { code } => {
            state
                .wallets
                .submit_recovery_shard(
                    &session_id,
                    ShardRole::BackupOwner,
                    ShardMaterial::recovery_code(code),
                )
                .await
        }
        ShardSubmission::Device { credential } => {
            let credential = credential.into_credential()?;
            state
                .wallets
                .submit_device_shard(&session_id, credential)
                .await
        }
        ShardSubmission::Server => {
            let auth = auth_context(&headers)?;
            state.wallets.request_server_shard(&session_id, &auth).await
        }
    };
    timer.observe();
    progress_response(&state, result)
}

/// `POST /recovery/:session/resume`
async fn resume_recovery_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RecoveryProgressResponse>, ApiError> {
    let result = state.wallets.resume_recovery(&session_id).await;
    progress_response(&state, result)
}

fn progress_response(
    state: &AppState,
    result: WalletResult<RecoveryProgress>,
) -> Result<Json<RecoveryProgressResponse>, ApiError> {
    let progress = state.track(result)?;
    if progress.session.state == SessionState::Completed {
        state.metrics.recovery_sessions_completed_total.inc();
    }
    Ok(Json(progress.into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use trishard_wallet::collaborator::LocalThresholdService;
    use trishard_wallet::config::{KdfParams, LifecycleConfig};
    use trishard_wallet::storage::WalletDb;

    use crate::metrics::WalletMetrics;

    const TOKEN: &str = "Bearer session-token";

    fn test_router() -> Router {
        let db = WalletDb::open_temporary().expect("temp db");
        let service = Arc::new(LocalThresholdService::new());
        let config = LifecycleConfig {
            kdf: KdfParams::insecure_fast(),
            ..LifecycleConfig::default()
        };
        create_router(AppState {
            wallets: Arc::new(WalletSession::new(db, service.clone(), service, config)),
            metrics: Arc::new(WalletMetrics::new().expect("metrics")),
            version: "0.1.0-test".into(),
        })
    }

    /// Sends a request and returns (status, body_bytes).
    async fn send(
        router: &Router,
        method: &str,
        path: &str,
        body: Option<Value>,
        auth: bool,
    ) -> (StatusCode, Vec<u8>) {
        let mut req = Request::builder().method(method).uri(path);
        if auth {
            req = req.header("authorization", TOKEN);
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
        let (status, body) = send(router, "GET", path, None, false).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn post_json(
        router: &Router,
        path: &str,
        body: Value,
        auth: bool,
    ) -> (StatusCode, Value) {
        let (status, body) = send(router, "POST", path, Some(body), auth).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn create(router: &Router, user: &str) -> Value {
        let (status, body) = post_json(
            router,
            "/wallets",
            json!({
                "user_id": user,
                "chain": "BSC",
                "credential": { "passphrase": "device passphrase" },
            }),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let router = test_router();
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], "0.1.0-test");
    }

    #[tokio::test]
    async fn unknown_wallet_is_not_found() {
        let router = test_router();
        let (status, body) = get(&router, "/wallets/nobody/BSC").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "wallet_not_found");
    }

    #[tokio::test]
    async fn create_without_bearer_proof_is_unauthorized() {
        let router = test_router();
        let (status, body) = post_json(
            &router,
            "/wallets",
            json!({
                "user_id": "u1",
                "chain": "BSC",
                "credential": { "passphrase": "device passphrase" },
            }),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn create_then_duplicate_conflicts() {
        let router = test_router();
        let wallet = create(&router, "u1").await;
        assert_eq!(wallet["status"], "active");
        assert_eq!(wallet["backup_warning"], true);

        let (status, body) = post_json(
            &router,
            "/wallets",
            json!({
                "user_id": "u1",
                "chain": "BSC",
                "credential": { "passphrase": "device passphrase" },
            }),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "duplicate_wallet");
    }

    #[tokio::test]
    async fn ensure_returns_existing_wallet() {
        let router = test_router();
        let wallet = create(&router, "u1").await;
        let (status, body) = post_json(
            &router,
            "/wallets",
            json!({
                "user_id": "u1",
                "chain": "BSC",
                "credential": { "passphrase": "device passphrase" },
                "ensure": true,
            }),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wallet_address"], wallet["wallet_address"]);
    }

    #[tokio::test]
    async fn backup_export_is_display_once() {
        let router = test_router();
        create(&router, "u1").await;

        let (status, body) =
            post_json(&router, "/wallets/u1/BSC/backup/export", json!({}), false).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["recovery_code"].as_str().unwrap().starts_with("tsc1"));

        let (status, body) =
            post_json(&router, "/wallets/u1/BSC/backup/export", json!({}), false).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["remediation"], "regenerate_backup");

        let (status, body) =
            post_json(&router, "/wallets/u1/BSC/backup/ack", json!({}), false).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["confirmed_at"].is_string());
    }

    #[tokio::test]
    async fn recovery_with_backup_code_and_server_shard() {
        let router = test_router();
        create(&router, "u1").await;
        let (_, backup) =
            post_json(&router, "/wallets/u1/BSC/backup/export", json!({}), false).await;

        let (status, session) = post_json(
            &router,
            "/recovery",
            json!({
                "user_id": "u1",
                "chain": "BSC",
                "credential": { "passphrase": "new device" },
            }),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = session["session_id"].as_str().unwrap().to_string();

        let path = format!("/recovery/{session_id}/shards");
        let (status, progress) = post_json(
            &router,
            &path,
            json!({ "source": "recovery_code", "code": backup["recovery_code"] }),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{progress}");
        assert_eq!(progress["session"]["state"], "awaiting_shards");

        let (status, progress) =
            post_json(&router, &path, json!({ "source": "server" }), true).await;
        assert_eq!(status, StatusCode::OK, "{progress}");
        assert_eq!(progress["session"]["state"], "completed");
        assert!(progress["signer"]["public_key"].is_string());

        let (_, wallet) = get(&router, "/wallets/u1/BSC").await;
        assert_eq!(wallet["status"], "active");

        let (status, metrics) = send(&router, "GET", "/metrics", None, false).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(metrics).unwrap();
        assert!(text.contains("trishard_recovery_sessions_completed_total 1"));
        assert!(text.contains("trishard_backups_exported_total 1"));
    }

    #[tokio::test]
    async fn wrong_device_passphrase_is_unauthorized_not_corrupted() {
        let router = test_router();
        create(&router, "u1").await;
        let (_, session) = post_json(
            &router,
            "/recovery",
            json!({
                "user_id": "u1",
                "chain": "BSC",
                "credential": { "passphrase": "new device" },
            }),
            false,
        )
        .await;
        let path = format!("/recovery/{}/shards", session["session_id"].as_str().unwrap());

        let (status, body) = post_json(
            &router,
            &path,
            json!({ "source": "device", "credential": { "passphrase": "wrong" } }),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "wrong_credential");
        assert_eq!(body["remediation"], "reprompt");
        assert!(body["attempts_remaining"].is_u64());
    }

    #[tokio::test]
    async fn malformed_recovery_code_is_unprocessable() {
        let router = test_router();
        create(&router, "u1").await;
        let (_, session) = post_json(
            &router,
            "/recovery",
            json!({
                "user_id": "u1",
                "chain": "BSC",
                "credential": { "passphrase": "new device" },
            }),
            false,
        )
        .await;
        let path = format!("/recovery/{}/shards", session["session_id"].as_str().unwrap());

        let (status, body) = post_json(
            &router,
            &path,
            json!({ "source": "recovery_code", "code": "tsc1notarealcode" }),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "invalid_shard");
    }

    #[tokio::test]
    async fn delete_requires_matching_confirmation() {
        let router = test_router();
        let wallet = create(&router, "u1").await;

        let (status, body) = send(
            &router,
            "DELETE",
            "/wallets/u1/BSC",
            Some(json!({ "confirmation": "not-the-address" })),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["remediation"], "reprompt");

        let (status, _) = send(
            &router,
            "DELETE",
            "/wallets/u1/BSC",
            Some(json!({ "confirmation": wallet["wallet_address"] })),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = get(&router, "/wallets/u1/BSC").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_device_key_is_rejected_before_the_facade() {
        let router = test_router();
        let (status, body) = post_json(
            &router,
            "/wallets",
            json!({
                "user_id": "u1",
                "chain": "BSC",
                "credential": { "device_key": "abcd" },
            }),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }
}
