//! Single-flight access token refresh.
//!
//! Every request that receives a 401 funnels through [`RefreshCoordinator`].
//! The first one starts the refresh; any that arrive while it is outstanding
//! wait for its outcome instead of starting their own. When recovery is not
//! possible the session is torn down exactly once and every later caller gets
//! [`RefreshOutcome::Redirecting`].

use super::transport::{ApiRequest, HttpTransport};
use crate::navigation::Navigator;
use crate::redact::redact_secrets;
use crate::session::{Session, StoreError};
use crate::types::{RefreshTokenRequest, RefreshTokenResponse};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("no refresh token is stored")]
    MissingRefreshToken,
    #[error("refresh response carried no access token")]
    MissingAccessToken,
    #[error("refresh endpoint rejected the token (status {0})")]
    Rejected(u16),
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh response is invalid: {0}")]
    InvalidResponse(String),
    #[error("failed to persist refreshed tokens: {0}")]
    Storage(String),
    #[error("refresh was abandoned before it settled")]
    Abandoned,
}

/// What a request that received a 401 should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Replay the request with this access token.
    Retry(String),
    /// The session has been torn down; the request is dropped.
    Redirecting,
    /// The refresh failed; the request is rejected with this error.
    Failed(RefreshError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
    Redirecting,
}

enum PhaseState {
    Idle,
    Refreshing {
        cycle: u64,
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
    Redirecting,
}

/// Runs a blocking session store operation on the blocking pool.
async fn off_runtime<T: Send + 'static>(
    op: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, StoreError> {
    tokio::task::spawn_blocking(op)
        .await
        .unwrap_or_else(|e| Err(StoreError::Backend(e.to_string())))
}

/// Performs the one outbound refresh call of a refresh cycle.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshTokenResponse, RefreshError>;
}

/// Refreshes through the raw transport so the call never re-enters the
/// 401 handling of [`super::ApiClient`].
pub struct HttpTokenRefresher {
    transport: Arc<dyn HttpTransport>,
    refresh_path: String,
}

impl HttpTokenRefresher {
    pub fn new(transport: Arc<dyn HttpTransport>, refresh_path: impl Into<String>) -> Self {
        Self {
            transport,
            refresh_path: refresh_path.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshTokenResponse, RefreshError> {
        let body = serde_json::to_value(RefreshTokenRequest {
            refresh_token: refresh_token.to_string(),
        })
        .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        let request = ApiRequest::post(self.refresh_path.clone()).with_json(body);

        let res = self
            .transport
            .execute(&request)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        if !res.is_success() {
            return Err(RefreshError::Rejected(res.status));
        }
        res.json::<RefreshTokenResponse>()
            .map_err(|e| RefreshError::InvalidResponse(redact_secrets(&e.to_string()).into_owned()))
    }
}

pub struct RefreshCoordinator {
    session: Session,
    refresher: Arc<dyn TokenRefresher>,
    navigator: Arc<dyn Navigator>,
    login_route: String,
    state: Mutex<PhaseState>,
    cycles: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        session: Session,
        refresher: Arc<dyn TokenRefresher>,
        navigator: Arc<dyn Navigator>,
        login_route: impl Into<String>,
    ) -> Self {
        Self {
            session,
            refresher,
            navigator,
            login_route: login_route.into(),
            state: Mutex::new(PhaseState::Idle),
            cycles: AtomicU64::new(0),
        }
    }

    pub async fn phase(&self) -> RefreshPhase {
        match &*self.state.lock().await {
            PhaseState::Idle => RefreshPhase::Idle,
            PhaseState::Refreshing { .. } => RefreshPhase::Refreshing,
            PhaseState::Redirecting => RefreshPhase::Redirecting,
        }
    }

    /// Requests currently parked behind the in-flight refresh.
    pub async fn queued_requests(&self) -> usize {
        match &*self.state.lock().await {
            PhaseState::Refreshing { waiters, .. } => waiters.len(),
            _ => 0,
        }
    }

    /// Returns to `Idle`, e.g. after a fresh login. Requests still parked
    /// behind a refresh are failed with [`RefreshError::Abandoned`], and a
    /// refresh call still in flight settles only its own leader: its tokens
    /// are discarded.
    pub async fn reset(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, PhaseState::Idle);
        if let PhaseState::Refreshing { cycle, waiters } = previous {
            debug!(cycle, abandoned = waiters.len(), "refresh cycle abandoned by reset");
            for waiter in waiters {
                let _ = waiter.send(RefreshOutcome::Failed(RefreshError::Abandoned));
            }
        }
        debug!("refresh coordinator reset");
    }

    /// Entry point for a request that came back 401.
    pub async fn handle_unauthorized(&self, retried: bool) -> RefreshOutcome {
        if retried {
            warn!("request still unauthorized after refresh");
            return self.teardown(None).await;
        }

        let role = {
            let mut state = self.state.lock().await;
            if matches!(*state, PhaseState::Idle) {
                let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
                *state = PhaseState::Refreshing {
                    cycle,
                    waiters: vec![],
                };
                Role::Leader(cycle)
            } else if let PhaseState::Refreshing { waiters, .. } = &mut *state {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                debug!(queued = waiters.len(), "refresh in flight, queueing request");
                Role::Follower(rx)
            } else {
                return RefreshOutcome::Redirecting;
            }
        };

        match role {
            Role::Follower(rx) => rx
                .await
                .unwrap_or(RefreshOutcome::Failed(RefreshError::Abandoned)),
            Role::Leader(cycle) => self.run_refresh(cycle).await,
        }
    }

    /// Clears the session and navigates to the login route. Only the first
    /// caller does the work; later callers get `Redirecting`.
    pub async fn terminate_session(&self) -> RefreshOutcome {
        self.teardown(None).await
    }

    /// Locks the state if `cycle` is still the refresh in progress; otherwise
    /// returns what the stale leader should report.
    async fn lock_cycle(&self, cycle: u64) -> Result<MutexGuard<'_, PhaseState>, RefreshOutcome> {
        let state = self.state.lock().await;
        let current = match &*state {
            PhaseState::Refreshing { cycle, .. } => Some(*cycle),
            PhaseState::Redirecting => return Err(RefreshOutcome::Redirecting),
            PhaseState::Idle => None,
        };
        if current == Some(cycle) {
            return Ok(state);
        }
        debug!(cycle, "refresh cycle was reset, discarding its result");
        Err(RefreshOutcome::Failed(RefreshError::Abandoned))
    }

    async fn run_refresh(&self, cycle: u64) -> RefreshOutcome {
        let Some(refresh_token) = self.session.refresh_token() else {
            warn!("no refresh token available");
            return match self.lock_cycle(cycle).await {
                Ok(state) => {
                    self.teardown_locked(state, Some(RefreshError::MissingRefreshToken))
                        .await
                }
                Err(outcome) => outcome,
            };
        };

        info!(cycle, "refreshing access token");
        let result = self.refresher.refresh(&refresh_token).await;

        let state = match self.lock_cycle(cycle).await {
            Ok(state) => state,
            Err(outcome) => return outcome,
        };
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                return self.teardown_locked(state, Some(e)).await;
            }
        };
        let Some(access_token) = response.access_token().map(str::to_string) else {
            warn!("token refresh returned no access token");
            return self
                .teardown_locked(state, Some(RefreshError::MissingAccessToken))
                .await;
        };

        let session = self.session.clone();
        let token = access_token.clone();
        let rotated = response.refresh_token().map(str::to_string);
        let roles = response.roles.clone();
        let persisted = off_runtime(move || {
            session.persist_tokens(&token, rotated.as_deref(), roles.as_deref())
        })
        .await;
        if let Err(e) = persisted {
            warn!(error = %e, "failed to persist refreshed tokens");
            return self
                .teardown_locked(state, Some(RefreshError::Storage(e.to_string())))
                .await;
        }

        let mut state = state;
        let waiters = match std::mem::replace(&mut *state, PhaseState::Idle) {
            PhaseState::Refreshing { waiters, .. } => waiters,
            _ => vec![],
        };
        drop(state);

        info!(cycle, replayed = waiters.len() + 1, "access token refreshed");
        for waiter in waiters {
            let _ = waiter.send(RefreshOutcome::Retry(access_token.clone()));
        }
        RefreshOutcome::Retry(access_token)
    }

    async fn teardown(&self, reason: Option<RefreshError>) -> RefreshOutcome {
        let state = self.state.lock().await;
        self.teardown_locked(state, reason).await
    }

    /// Clears storage and navigates while still holding the state lock.
    async fn teardown_locked(
        &self,
        mut state: MutexGuard<'_, PhaseState>,
        reason: Option<RefreshError>,
    ) -> RefreshOutcome {
        let waiters = match std::mem::replace(&mut *state, PhaseState::Redirecting) {
            PhaseState::Redirecting => {
                debug!("session teardown already underway");
                return RefreshOutcome::Redirecting;
            }
            PhaseState::Refreshing { waiters, .. } => waiters,
            PhaseState::Idle => vec![],
        };

        let session = self.session.clone();
        if let Err(e) = off_runtime(move || session.clear()).await {
            warn!(error = %e, "failed to clear session during teardown");
        }
        warn!(route = %self.login_route, "session terminated, redirecting to login");
        self.navigator.navigate(&self.login_route);

        let outcome = match reason {
            Some(e) => RefreshOutcome::Failed(e),
            None => RefreshOutcome::Redirecting,
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }
}

enum Role {
    Leader(u64),
    Follower(oneshot::Receiver<RefreshOutcome>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::ApiResponse;
    use crate::session::SESSION_KEYS;
    use crate::test_support::{seeded_session, CountingStore, FakeRefresher, FakeTransport};
    use crate::navigation::RecordingNavigator;

    fn coordinator(
        session: Session,
        refresher: Arc<FakeRefresher>,
    ) -> (Arc<RefreshCoordinator>, Arc<RecordingNavigator>) {
        let navigator = Arc::new(RecordingNavigator::new());
        let coordinator = Arc::new(RefreshCoordinator::new(
            session,
            refresher,
            navigator.clone(),
            "/login",
        ));
        (coordinator, navigator)
    }

    async fn wait_for_queue(coordinator: &RefreshCoordinator, expected: usize) {
        while coordinator.queued_requests().await < expected {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_unauthorized_requests_share_one_refresh() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::gated_success("new", Some("r2")));
        let (coordinator, navigator) = coordinator(session.clone(), refresher.clone());

        let mut handles = vec![];
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.handle_unauthorized(false).await
            }));
        }
        wait_for_queue(&coordinator, 4).await;
        assert_eq!(coordinator.phase().await, RefreshPhase::Refreshing);
        refresher.release();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                RefreshOutcome::Retry("new".to_string())
            );
        }
        assert_eq!(refresher.calls(), 1);
        assert_eq!(refresher.tokens_seen(), vec!["r1".to_string()]);
        assert_eq!(session.access_token().as_deref(), Some("new"));
        assert_eq!(session.refresh_token().as_deref(), Some("r2"));
        assert_eq!(coordinator.phase().await, RefreshPhase::Idle);
        assert!(navigator.history().is_empty());
    }

    #[tokio::test]
    async fn refresh_failure_rejects_every_queued_request() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::gated_failure(RefreshError::Rejected(401)));
        let (coordinator, navigator) = coordinator(session.clone(), refresher.clone());

        let mut handles = vec![];
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.handle_unauthorized(false).await
            }));
        }
        wait_for_queue(&coordinator, 2).await;
        refresher.release();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                RefreshOutcome::Failed(RefreshError::Rejected(401))
            );
        }
        assert_eq!(refresher.calls(), 1);
        assert_eq!(session.access_token(), None);
        assert_eq!(session.refresh_token(), None);
        assert_eq!(navigator.history(), vec!["/login".to_string()]);
        assert_eq!(coordinator.phase().await, RefreshPhase::Redirecting);
    }

    #[tokio::test]
    async fn missing_access_token_in_response_is_a_failure() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::responding(RefreshTokenResponse {
            access_token: None,
            refresh_token: Some("r2".to_string()),
            roles: None,
        }));
        let (coordinator, navigator) = coordinator(session.clone(), refresher);

        assert_eq!(
            coordinator.handle_unauthorized(false).await,
            RefreshOutcome::Failed(RefreshError::MissingAccessToken)
        );
        assert_eq!(session.refresh_token(), None);
        assert_eq!(navigator.history().len(), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_tears_down_without_calling_refresh() {
        let session = Session::in_memory();
        session.persist_tokens("old", None, None).unwrap();
        let refresher = Arc::new(FakeRefresher::succeeding("new", None));
        let (coordinator, navigator) = coordinator(session.clone(), refresher.clone());

        assert_eq!(
            coordinator.handle_unauthorized(false).await,
            RefreshOutcome::Failed(RefreshError::MissingRefreshToken)
        );
        assert_eq!(refresher.calls(), 0);
        assert_eq!(session.access_token(), None);
        assert_eq!(navigator.history(), vec!["/login".to_string()]);
    }

    #[tokio::test]
    async fn retried_request_goes_straight_to_teardown() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::succeeding("new", None));
        let (coordinator, navigator) = coordinator(session.clone(), refresher.clone());

        assert_eq!(
            coordinator.handle_unauthorized(true).await,
            RefreshOutcome::Redirecting
        );
        assert_eq!(refresher.calls(), 0);
        assert_eq!(session.refresh_token(), None);
        assert_eq!(navigator.history().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_teardowns_navigate_and_clear_once() {
        let store = Arc::new(CountingStore::default());
        let session = Session::new(store.clone());
        session.persist_tokens("old", Some("r1"), None).unwrap();
        let refresher = Arc::new(FakeRefresher::succeeding("new", None));
        let (coordinator, navigator) = coordinator(session.clone(), refresher);

        let (first, second) = tokio::join!(
            coordinator.terminate_session(),
            coordinator.terminate_session()
        );
        assert_eq!(first, RefreshOutcome::Redirecting);
        assert_eq!(second, RefreshOutcome::Redirecting);
        assert_eq!(navigator.history(), vec!["/login".to_string()]);
        for key in SESSION_KEYS {
            assert_eq!(store.removals(key), 1, "{key} cleared more than once");
        }
        assert_eq!(session.access_token(), None);

        // Further 401s are swallowed until the coordinator is reset.
        assert_eq!(
            coordinator.handle_unauthorized(false).await,
            RefreshOutcome::Redirecting
        );
        assert_eq!(navigator.history().len(), 1);
    }

    #[tokio::test]
    async fn reset_allows_a_new_refresh_cycle() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::succeeding("new", None));
        let (coordinator, _navigator) = coordinator(session.clone(), refresher.clone());

        coordinator.terminate_session().await;
        assert_eq!(coordinator.phase().await, RefreshPhase::Redirecting);

        coordinator.reset().await;
        session.persist_tokens("a", Some("r9"), None).unwrap();
        assert_eq!(
            coordinator.handle_unauthorized(false).await,
            RefreshOutcome::Retry("new".to_string())
        );
        assert_eq!(refresher.tokens_seen(), vec!["r9".to_string()]);
    }

    async fn wait_for_calls(refresher: &FakeRefresher, expected: usize) {
        while refresher.calls() < expected {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn reset_during_refresh_discards_the_stale_result() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::gated_rotating());
        let (coordinator, navigator) = coordinator(session.clone(), refresher.clone());

        let stale = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.handle_unauthorized(false).await })
        };
        wait_for_calls(&refresher, 1).await;

        // A login lands while the first refresh is still out.
        session.persist_tokens("fresh", Some("r9"), None).unwrap();
        coordinator.reset().await;

        let current = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.handle_unauthorized(false).await })
        };
        wait_for_calls(&refresher, 2).await;
        refresher.release();
        refresher.release();

        assert_eq!(
            stale.await.unwrap(),
            RefreshOutcome::Failed(RefreshError::Abandoned)
        );
        assert_eq!(
            current.await.unwrap(),
            RefreshOutcome::Retry("access-for-r9".to_string())
        );
        assert_eq!(
            refresher.tokens_seen(),
            vec!["r1".to_string(), "r9".to_string()]
        );
        assert_eq!(session.access_token().as_deref(), Some("access-for-r9"));
        assert_eq!(session.refresh_token().as_deref(), Some("r9-rotated"));
        assert_eq!(coordinator.phase().await, RefreshPhase::Idle);
        assert!(navigator.history().is_empty());
    }

    #[tokio::test]
    async fn stale_refresh_failure_does_not_tear_down_new_session() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::gated_failure(RefreshError::Rejected(401)));
        let (coordinator, navigator) = coordinator(session.clone(), refresher.clone());

        let stale = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.handle_unauthorized(false).await })
        };
        wait_for_calls(&refresher, 1).await;
        session.persist_tokens("fresh", Some("r9"), None).unwrap();
        coordinator.reset().await;
        refresher.release();

        assert_eq!(
            stale.await.unwrap(),
            RefreshOutcome::Failed(RefreshError::Abandoned)
        );
        assert_eq!(session.access_token().as_deref(), Some("fresh"));
        assert!(navigator.history().is_empty());
        assert_eq!(coordinator.phase().await, RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn sequential_refreshes_are_allowed_once_settled() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::succeeding("new", None));
        let (coordinator, _navigator) = coordinator(session, refresher.clone());

        coordinator.handle_unauthorized(false).await;
        coordinator.handle_unauthorized(false).await;
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn refresh_persists_returned_roles() {
        let session = seeded_session("old", "r1");
        let refresher = Arc::new(FakeRefresher::responding(RefreshTokenResponse {
            access_token: Some("new".to_string()),
            refresh_token: None,
            roles: Some(vec!["Manager".to_string()]),
        }));
        let (coordinator, _navigator) = coordinator(session.clone(), refresher);

        coordinator.handle_unauthorized(false).await;
        assert_eq!(session.roles(), vec!["Manager".to_string()]);
        assert_eq!(session.refresh_token().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn http_refresher_posts_refresh_token() {
        let transport = Arc::new(FakeTransport::new(|request| {
            assert_eq!(request.path, "/auth/refresh-token");
            assert_eq!(
                request.body,
                Some(serde_json::json!({"refreshToken": "r1"}))
            );
            Ok(ApiResponse::new(
                200,
                r#"{"accessToken":"a2","refreshToken":"r2"}"#,
            ))
        }));
        let refresher = HttpTokenRefresher::new(transport.clone(), "/auth/refresh-token");

        let response = refresher.refresh("r1").await.unwrap();
        assert_eq!(response.access_token(), Some("a2"));
        assert_eq!(response.refresh_token(), Some("r2"));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(transport.requests()[0].bearer, None);
    }

    #[tokio::test]
    async fn http_refresher_maps_error_status() {
        let transport = Arc::new(FakeTransport::new(|_| Ok(ApiResponse::new(403, ""))));
        let refresher = HttpTokenRefresher::new(transport, "/auth/refresh-token");
        assert_eq!(
            refresher.refresh("r1").await.unwrap_err(),
            RefreshError::Rejected(403)
        );
    }
}
