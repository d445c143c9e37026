use crate::http::{ApiClient, ApiError, ApiRequest};
use crate::settings::ClientConfig;
use crate::types::{LoginRequest, LoginResponse, LogoutRequest, SessionCredentials};
use std::sync::Arc;
use tracing::{info, warn};

/// Login and logout around the shared client session.
pub struct AuthService {
    client: Arc<ApiClient>,
    login_path: String,
    logout_path: String,
}

impl AuthService {
    pub fn new(client: Arc<ApiClient>, config: &ClientConfig) -> Self {
        Self {
            client,
            login_path: config.login_path.clone(),
            logout_path: config.logout_path.clone(),
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<SessionCredentials, ApiError> {
        let request = LoginRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        let response: LoginResponse = self.client.post_json(&self.login_path, &request).await?;

        let Some(access_token) = response.access_token() else {
            return Err(ApiError::InvalidResponse(
                "login response carried no access token".to_string(),
            ));
        };
        let credentials = SessionCredentials {
            access_token: Some(access_token.to_string()),
            refresh_token: response.refresh_token().map(str::to_string),
            roles: response.roles.clone().unwrap_or_default(),
        };

        let session = self.client.session();
        session.clear()?;
        session.store_credentials(&credentials)?;
        self.client.coordinator().reset().await;

        info!(roles = ?credentials.roles, "logged in");
        Ok(credentials)
    }

    /// Revokes the refresh token server-side when possible; the local session
    /// is cleared either way.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let session = self.client.session();
        let body = LogoutRequest {
            refresh_token: session.refresh_token(),
        };

        if session.access_token().is_some() {
            let request = serde_json::to_value(&body)
                .map(|json| ApiRequest::post(self.logout_path.clone()).with_json(json));
            match request {
                Ok(request) => {
                    if let Err(e) = self.client.send(request).await {
                        warn!(error = %e, "logout request failed, clearing session locally");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode logout request"),
            }
        }

        session.clear()?;
        info!("logged out");
        Ok(())
    }

    pub fn current_roles(&self) -> Vec<String> {
        self.client.session().roles()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.current_roles()
            .iter()
            .any(|r| r.eq_ignore_ascii_case(role))
    }
}
