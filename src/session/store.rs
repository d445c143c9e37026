use crate::types::SessionCredentials;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

pub const KEY_ACCESS_TOKEN: &str = "accessToken";
pub const KEY_REFRESH_TOKEN: &str = "refreshToken";
/// Legacy single-role key still read by older route guards.
pub const KEY_USER_ROLE: &str = "userRole";
pub const KEY_USER_ROLES: &str = "userRoles";

pub const SESSION_KEYS: [&str; 4] = [
    KEY_ACCESS_TOKEN,
    KEY_REFRESH_TOKEN,
    KEY_USER_ROLE,
    KEY_USER_ROLES,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential storage is unavailable: {0}")]
    Unavailable(String),
    #[error("credential storage failed: {0}")]
    Backend(String),
}

/// Persisted client-side key/value storage for session credentials.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_values<T>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> T {
        let mut guard = match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_values(|values| values.get(key).cloned()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_values(|values| values.insert(key.to_string(), value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.with_values(|values| values.remove(key));
        Ok(())
    }
}

/// Typed view over the raw session keys.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn SessionStore>,
}

impl Session {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()))
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(key, error = %e, "failed to read session key");
                None
            }
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(KEY_ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(KEY_REFRESH_TOKEN)
    }

    pub fn roles(&self) -> Vec<String> {
        if let Some(raw) = self.read(KEY_USER_ROLES) {
            if let Ok(roles) = serde_json::from_str::<Vec<String>>(&raw) {
                return roles;
            }
        }
        self.read(KEY_USER_ROLE).into_iter().collect()
    }

    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            access_token: self.access_token(),
            refresh_token: self.refresh_token(),
            roles: self.roles(),
        }
    }

    /// Overwrites the access token; the refresh token and roles only when a
    /// new value is supplied.
    pub fn persist_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        roles: Option<&[String]>,
    ) -> Result<(), StoreError> {
        self.store.set(KEY_ACCESS_TOKEN, access_token)?;
        if let Some(refresh_token) = refresh_token {
            self.store.set(KEY_REFRESH_TOKEN, refresh_token)?;
        }
        if let Some(roles) = roles {
            self.persist_roles(roles)?;
        }
        Ok(())
    }

    fn persist_roles(&self, roles: &[String]) -> Result<(), StoreError> {
        let encoded =
            serde_json::to_string(roles).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.store.set(KEY_USER_ROLES, &encoded)?;
        match roles.first() {
            Some(role) => self.store.set(KEY_USER_ROLE, role),
            None => self.store.remove(KEY_USER_ROLE),
        }
    }

    pub fn store_credentials(&self, credentials: &SessionCredentials) -> Result<(), StoreError> {
        match credentials.access_token.as_deref() {
            Some(access_token) => self.persist_tokens(
                access_token,
                credentials.refresh_token.as_deref(),
                Some(credentials.roles.as_slice()),
            ),
            None => self.clear(),
        }
    }

    /// Removes every session key. Keeps going past individual failures and
    /// reports the first one.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for key in SESSION_KEYS {
            if let Err(e) = self.store.remove(key) {
                warn!(key, error = %e, "failed to remove session key");
                first_error.get_or_insert(e);
            }
        }
        debug!("session cleared");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
