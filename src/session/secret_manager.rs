use super::store::{SessionStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Session storage backed by the OS keychain, one entry per session key.
///
/// Reads are served from an in-memory cache after the first hit so request
/// interception does not touch the keychain on every call.
pub struct KeyringSessionStore {
    service: String,
    entries: Mutex<HashMap<String, Arc<keyring::Entry>>>,
    cache: Mutex<HashMap<String, Option<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn map_keyring_error(err: keyring::Error) -> StoreError {
    match err {
        keyring::Error::NoStorageAccess(e) => StoreError::Unavailable(e.to_string()),
        keyring::Error::PlatformFailure(e) => StoreError::Unavailable(e.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

impl KeyringSessionStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entries: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &str) -> Result<Arc<keyring::Entry>, StoreError> {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get(key) {
            return Ok(entry.clone());
        }
        let entry = Arc::new(keyring::Entry::new(&self.service, key).map_err(map_keyring_error)?);
        entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        lock(&self.cache)
    }

    /// Probes the backend with a read; a missing or unreadable entry still
    /// means the keychain itself answered.
    pub fn is_available(&self) -> bool {
        use keyring::Error::{Ambiguous, BadEncoding, NoEntry};

        self.entry(super::KEY_ACCESS_TOKEN).is_ok_and(|entry| {
            matches!(
                entry.get_password(),
                Ok(_) | Err(NoEntry | BadEncoding(_) | Ambiguous(_))
            )
        })
    }
}

impl SessionStore for KeyringSessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(cached) = self.cache().get(key) {
            return Ok(cached.clone());
        }

        let value = match self.entry(key)?.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => return Err(map_keyring_error(e)),
        };
        self.cache().insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(map_keyring_error)?;
        self.cache().insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                self.cache().insert(key.to_string(), None);
                Ok(())
            }
            Err(e) => {
                // The keychain state is unknown now; read through next time.
                self.cache().remove(key);
                Err(map_keyring_error(e))
            }
        }
    }
}
