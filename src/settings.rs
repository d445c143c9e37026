use figment::{
  providers::{Env, Format, Json, Serialized},
  Figment,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variables with this prefix override file values,
/// e.g. `FLEARN_API_BASE_URL`.
pub const ENV_PREFIX: &str = "FLEARN_";

#[derive(Debug, Error)]
pub enum SettingsError {
  #[error("invalid settings: {0}")]
  Figment(#[from] Box<figment::Error>),
}

/// Resolved values the client layers are built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  pub api_base_url: String,
  pub request_timeout_seconds: u64,
  pub login_route: String,
  pub app_origin: String,
  pub refresh_path: String,
  pub login_path: String,
  pub login_alias_path: String,
  pub logout_path: String,
  pub keyring_service: String,
  pub use_keyring: bool,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      api_base_url: "http://localhost:8080/api".to_string(),
      request_timeout_seconds: 30,
      login_route: "/login".to_string(),
      app_origin: "http://localhost:5173".to_string(),
      refresh_path: "/auth/refresh-token".to_string(),
      login_path: "/auth/login".to_string(),
      login_alias_path: "/auth/signin".to_string(),
      logout_path: "/auth/logout".to_string(),
      keyring_service: "com.flearn.client".to_string(),
      use_keyring: true,
    }
  }
}

fn non_blank(value: String, fallback: String) -> String {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    fallback
  } else {
    trimmed.to_string()
  }
}

impl ClientConfig {
  /// Defaults, then the JSON file at `path` when it exists, then `FLEARN_*`
  /// environment variables.
  pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(ClientConfig::default()));
    if let Some(path) = path {
      if path.exists() {
        info!(path = %path.display(), "loading settings file");
        figment = figment.merge(Json::file_exact(path));
      } else {
        debug!(path = %path.display(), "settings file not found, using defaults");
      }
    }
    figment.merge(Env::prefixed(ENV_PREFIX))
  }

  pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
    let config: ClientConfig = Self::figment(path).extract().map_err(Box::new)?;
    Ok(config.normalized())
  }

  /// Blank strings fall back to their defaults; the base URL loses any
  /// trailing slash.
  fn normalized(self) -> Self {
    let defaults = ClientConfig::default();
    let api_base_url = non_blank(self.api_base_url, defaults.api_base_url);
    Self {
      api_base_url: api_base_url.trim_end_matches('/').to_string(),
      request_timeout_seconds: self.request_timeout_seconds,
      login_route: non_blank(self.login_route, defaults.login_route),
      app_origin: non_blank(self.app_origin, defaults.app_origin),
      refresh_path: non_blank(self.refresh_path, defaults.refresh_path),
      login_path: non_blank(self.login_path, defaults.login_path),
      login_alias_path: non_blank(self.login_alias_path, defaults.login_alias_path),
      logout_path: non_blank(self.logout_path, defaults.logout_path),
      keyring_service: non_blank(self.keyring_service, defaults.keyring_service),
      use_keyring: self.use_keyring,
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_seconds.max(1))
  }

  /// Endpoints whose 401s are returned to the caller without a refresh attempt.
  pub fn auth_exempt_paths(&self) -> [&str; 3] {
    [
      self.login_path.as_str(),
      self.login_alias_path.as_str(),
      self.refresh_path.as_str(),
    ]
  }
}
