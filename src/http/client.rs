use super::refresh::{HttpTokenRefresher, RefreshCoordinator, RefreshError, RefreshOutcome};
use super::transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, TransportError};
use crate::navigation::Navigator;
use crate::redact::redact_secrets;
use crate::session::{Session, StoreError};
use crate::settings::ClientConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Network(#[from] TransportError),
    #[error("server responded with status {status}")]
    Status { status: u16, body: String },
    #[error("session expired, redirecting to login")]
    SessionTerminated,
    #[error("token refresh failed: {0}")]
    RefreshFailed(RefreshError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// REST client for the Flearn API.
///
/// Attaches the stored access token to every request and hands 401s on
/// non-auth endpoints to the shared [`RefreshCoordinator`]. A request is
/// replayed at most once; a second 401 ends the session.
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    session: Session,
    coordinator: Arc<RefreshCoordinator>,
    auth_exempt: Vec<String>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        session: Session,
        coordinator: Arc<RefreshCoordinator>,
        config: &ClientConfig,
    ) -> Self {
        let auth_exempt = config
            .auth_exempt_paths()
            .iter()
            .map(|p| normalize_endpoint(p))
            .collect();
        Self {
            transport,
            session,
            coordinator,
            auth_exempt,
        }
    }

    /// Wires the production transport, refresher and coordinator.
    pub fn from_config(
        config: &ClientConfig,
        session: Session,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, TransportError> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(config)?);
        let refresher = Arc::new(HttpTokenRefresher::new(
            transport.clone(),
            config.refresh_path.clone(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            session.clone(),
            refresher,
            navigator,
            config.login_route.clone(),
        ));
        Ok(Self::new(transport, session, coordinator, config))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    fn is_auth_exempt(&self, request: &ApiRequest) -> bool {
        let endpoint = request.endpoint();
        self.auth_exempt.iter().any(|p| p == endpoint)
    }

    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if request.bearer.is_none() {
            request.bearer = self.session.access_token();
        }

        loop {
            let response = self.transport.execute(&request).await?;
            if response.is_success() {
                return Ok(response);
            }
            if response.status != 401 {
                return Err(ApiError::Status {
                    status: response.status,
                    body: redact_secrets(&response.text()).into_owned(),
                });
            }
            if self.is_auth_exempt(&request) {
                debug!(endpoint = request.endpoint(), "401 on auth endpoint");
                return Err(ApiError::Status {
                    status: 401,
                    body: redact_secrets(&response.text()).into_owned(),
                });
            }

            match self.coordinator.handle_unauthorized(request.retried).await {
                RefreshOutcome::Retry(token) => {
                    debug!(endpoint = request.endpoint(), "replaying request with refreshed token");
                    request.bearer = Some(token);
                    request.retried = true;
                }
                RefreshOutcome::Redirecting => return Err(ApiError::SessionTerminated),
                RefreshOutcome::Failed(e) => return Err(ApiError::RefreshFailed(e)),
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::get(path)).await?;
        decode(&response)
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::post(path).with_json(encode(body)?);
        let response = self.send(request).await?;
        decode(&response)
    }

    pub async fn put_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::put(path).with_json(encode(body)?);
        let response = self.send(request).await?;
        decode(&response)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await.map(|_| ())
    }
}

fn normalize_endpoint(path: &str) -> String {
    ApiRequest::get(path).endpoint().to_string()
}

fn encode<B: Serialize>(body: &B) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

fn decode<T: DeserializeOwned>(response: &ApiResponse) -> Result<T, ApiError> {
    response
        .json()
        .map_err(|e| ApiError::InvalidResponse(redact_secrets(&e.to_string()).into_owned()))
}
