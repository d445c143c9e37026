//! Shared fakes for unit tests.

use crate::http::{
    ApiRequest, ApiResponse, HttpTransport, RefreshError, TokenRefresher, TransportError,
};
use crate::session::{MemorySessionStore, Session, SessionStore, StoreError};
use crate::types::RefreshTokenResponse;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

pub(crate) fn seeded_session(access_token: &str, refresh_token: &str) -> Session {
    let session = Session::in_memory();
    session
        .persist_tokens(access_token, Some(refresh_token), None)
        .unwrap();
    session
}

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

pub(crate) struct FakeTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    pub(crate) fn new(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(vec![]),
        }
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

type RefreshResult = Result<RefreshTokenResponse, RefreshError>;

pub(crate) struct FakeRefresher {
    respond: Box<dyn Fn(&str) -> RefreshResult + Send + Sync>,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

impl FakeRefresher {
    fn new(respond: impl Fn(&str) -> RefreshResult + Send + Sync + 'static, gated: bool) -> Self {
        Self {
            respond: Box::new(respond),
            gate: gated.then(|| Semaphore::new(0)),
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(vec![]),
        }
    }

    fn fixed(result: RefreshResult, gated: bool) -> Self {
        Self::new(move |_| result.clone(), gated)
    }

    fn success(access_token: &str, refresh_token: Option<&str>) -> RefreshTokenResponse {
        RefreshTokenResponse {
            access_token: Some(access_token.to_string()),
            refresh_token: refresh_token.map(str::to_string),
            roles: None,
        }
    }

    pub(crate) fn responding(response: RefreshTokenResponse) -> Self {
        Self::fixed(Ok(response), false)
    }

    pub(crate) fn succeeding(access_token: &str, refresh_token: Option<&str>) -> Self {
        Self::fixed(Ok(Self::success(access_token, refresh_token)), false)
    }

    pub(crate) fn failing(error: RefreshError) -> Self {
        Self::fixed(Err(error), false)
    }

    /// Holds every refresh call until [`FakeRefresher::release`].
    pub(crate) fn gated_success(access_token: &str, refresh_token: Option<&str>) -> Self {
        Self::fixed(Ok(Self::success(access_token, refresh_token)), true)
    }

    pub(crate) fn gated_failure(error: RefreshError) -> Self {
        Self::fixed(Err(error), true)
    }

    /// Gated; answers refresh token `r` with access token `access-for-r` and
    /// rotated refresh token `r-rotated`.
    pub(crate) fn gated_rotating() -> Self {
        Self::new(
            |token| {
                Ok(Self::success(
                    &format!("access-for-{token}"),
                    Some(format!("{token}-rotated").as_str()),
                ))
            },
            true,
        )
    }

    /// Lets one held refresh call through.
    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, refresh_token: &str) -> RefreshResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(refresh_token.to_string());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        (self.respond)(refresh_token)
    }
}

/// Memory store that counts removals per key.
#[derive(Default)]
pub(crate) struct CountingStore {
    inner: MemorySessionStore,
    removals: Mutex<HashMap<String, usize>>,
}

impl CountingStore {
    pub(crate) fn removals(&self, key: &str) -> usize {
        self.removals.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

impl SessionStore for CountingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        *self.removals.lock().unwrap().entry(key.to_string()).or_default() += 1;
        self.inner.remove(key)
    }
}
