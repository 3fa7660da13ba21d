//! reqwest transport for the collaborator contracts.
//!
//! Status mapping: 2xx decodes the body, 4xx becomes
//! [`ServiceError::Rejected`] with the body's error code, 5xx and transport
//! failures become [`ServiceError::Unavailable`], and an undecodable 2xx
//! body becomes [`ServiceError::Malformed`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    parse_public_key, DeleteRequest, DeleteResponse, LookupRequest, LookupResponse,
    ProvisionRequest, ProvisionResponse,
    ProvisioningService, ReissueRequest, ReissueResponse, ReleaseRequest, ReleaseResponse,
    ServiceError, TransportKeyResponse,
};
use crate::config::DEFAULT_CONNECT_TIMEOUT;

#[derive(Deserialize, Debug)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// JSON-over-HTTP client shared by the provisioning and reconstruction
/// transports.
#[derive(Clone)]
pub struct HttpCollaborator {
    client: Client,
    base_url: String,
}

impl HttpCollaborator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ServiceError::Malformed(e.to_string()));
        }

        let code = status.as_u16();
        if status.is_client_error() {
            let body = response.json::<ErrorBody>().await.ok();
            let (error, message) = match body {
                Some(b) => (b.error, b.message),
                None => (None, None),
            };
            let message = message
                .or_else(|| error.clone())
                .unwrap_or_else(|| format!("HTTP {code}"));
            return Err(ServiceError::Rejected {
                status: code,
                code: error,
                message,
            });
        }

        Err(ServiceError::Unavailable(format!("HTTP {code}")))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        debug!(path, "collaborator GET");
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Self::handle_response(response).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        debug!(path, "collaborator POST");
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Self::handle_response(response).await
    }
}

/// [`ProvisioningService`] reached over HTTP.
#[derive(Clone)]
pub struct HttpProvisioningService {
    http: HttpCollaborator,
}

impl HttpProvisioningService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            http: HttpCollaborator::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl ProvisioningService for HttpProvisioningService {
    async fn transport_key(&self) -> Result<[u8; 32], ServiceError> {
        let response: TransportKeyResponse = self.http.get("/transport-key").await?;
        parse_public_key(&response.public_key)
    }

    async fn provision(
        &self,
        request: ProvisionRequest,
    ) -> Result<ProvisionResponse, ServiceError> {
        self.http.post("/provision", &request).await
    }

    async fn reissue_backup(
        &self,
        request: ReissueRequest,
    ) -> Result<ReissueResponse, ServiceError> {
        self.http.post("/backup/reissue", &request).await
    }

    async fn release_server_shard(
        &self,
        request: ReleaseRequest,
    ) -> Result<ReleaseResponse, ServiceError> {
        self.http.post("/server-shard/release", &request).await
    }

    async fn delete_wallet(&self, request: DeleteRequest) -> Result<DeleteResponse, ServiceError> {
        self.http.post("/wallets/delete", &request).await
    }

    async fn lookup_wallet(&self, request: LookupRequest) -> Result<LookupResponse, ServiceError> {
        self.http.post("/wallets/lookup", &request).await
    }
}
