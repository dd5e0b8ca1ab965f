//! 401 recovery.
//!
//! `SessionRefreshCoordinator` serializes token refreshes for one tab: the
//! first caller starts the refresh and every caller that arrives while it is
//! running queues behind it. When the refresh settles, the queue is released
//! in arrival order with the same outcome.
//!
//! `SessionRefreshStage` is the ERROR-phase pipeline stage that turns a 401
//! into a refresh and a single replay of the failed request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use super::session::SessionStore;
use super::token::AccessToken;
use crate::api::ApiError;
use crate::config::SessionConfig;
use crate::pipeline::{MiddlewareContext, Next, Stage};

type RefreshOutcome = Result<AccessToken, ApiError>;
type Waiters = VecDeque<oneshot::Sender<RefreshOutcome>>;

pub struct SessionRefreshCoordinator {
    store: Arc<SessionStore>,
    /// `Some` while a refresh is in flight, holding everyone waiting on it.
    in_flight: Mutex<Option<Waiters>>,
    refresh_calls: AtomicU64,
}

impl SessionRefreshCoordinator {
    pub fn new(store: Arc<SessionStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            in_flight: Mutex::new(None),
            refresh_calls: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn is_refreshing(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }

    /// Number of refreshes started since creation.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Obtain a fresh access token, joining the in-flight refresh if any.
    ///
    /// The refresh runs on its own task, so a caller that stops waiting
    /// does not strand the others.
    pub async fn refresh(self: &Arc<Self>) -> RefreshOutcome {
        let (tx, rx) = oneshot::channel();
        {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.as_mut() {
                Some(waiters) => {
                    waiters.push_back(tx);
                    debug!(queued = waiters.len(), "Refresh in flight, queued");
                }
                None => {
                    let mut waiters = VecDeque::new();
                    waiters.push_back(tx);
                    *in_flight = Some(waiters);
                    self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(Arc::clone(self).run_refresh());
                }
            }
        }

        rx.await.unwrap_or(Err(ApiError::RefreshAbandoned))
    }

    async fn run_refresh(self: Arc<Self>) {
        debug!("Starting token refresh");
        let outcome = self.store.refresh_token().await;
        if let Err(ref e) = outcome {
            warn!(error = %e, "Token refresh failed, ending session");
            self.store.force_logout(&ApiError::SessionExpired);
        }

        let waiters = self.in_flight.lock().await.take().unwrap_or_default();
        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Releasing refresh waiters");
        for waiter in waiters {
            // A waiter that gave up has dropped its receiver
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Recovers 401 failures by refreshing the session and replaying the
/// request once.
pub struct SessionRefreshStage {
    coordinator: Arc<SessionRefreshCoordinator>,
    config: SessionConfig,
}

impl SessionRefreshStage {
    pub fn new(coordinator: Arc<SessionRefreshCoordinator>, config: &SessionConfig) -> Self {
        Self {
            coordinator,
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Stage for SessionRefreshStage {
    fn name(&self) -> &str {
        "session-refresh"
    }

    async fn handle(&self, mut ctx: MiddlewareContext, next: Next<'_>) -> MiddlewareContext {
        if !ctx.is_unauthorized() {
            return next.run(ctx).await;
        }

        let url = ctx.request.url.clone();
        if self.config.is_refresh_url(&url) || ctx.request.is_auth_retry() {
            warn!(
                url = %url,
                retry = ctx.request.is_auth_retry(),
                cause = ?ctx.error,
                "Unauthorized after refresh, ending session"
            );
            self.coordinator.store().force_logout(&ApiError::SessionExpired);
            ctx.error = Some(ApiError::SessionExpired);
            return next.run(ctx).await;
        }

        match self.coordinator.refresh().await {
            Ok(_) => {
                let mut request = ctx.request.clone();
                request.mark_auth_retry();
                // The auth stage stamps the new token on the replay
                request.remove_header("authorization");
                let replayed = next.replay(request).await;
                debug!(url = %url, recovered = !replayed.has_error(), "Replayed request after refresh");
                ctx.response = replayed.response;
                ctx.error = replayed.error;
                if ctx.error.is_none() {
                    info!(url = %url, "Request recovered after token refresh");
                }
            }
            Err(e) => {
                debug!(url = %url, cause = %e, "Refresh failed, rejecting request");
                ctx.error = Some(ApiError::SessionExpired);
            }
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Transport;
    use crate::auth::session::tests::{session_response, MockAuth};
    use crate::auth::{Credentials, HeadlessNavigator, Navigator};
    use crate::pipeline::{AuthHeaderStage, Phase, Pipeline, RequestContext, ResponseContext, StatusCheckStage};
    use crate::resilience::RetryConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Accepts only requests bearing `valid`, recording what it saw.
    struct Gatekeeper {
        valid: String,
        seen: StdMutex<Vec<(String, Option<String>)>>,
        refresh_hits: AtomicU32,
    }

    #[async_trait]
    impl Transport for Gatekeeper {
        async fn send(&self, request: &RequestContext) -> Result<ResponseContext, ApiError> {
            if request.url.ends_with("/auth/refresh") {
                self.refresh_hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                return Ok(ResponseContext::new(401, json!({ "message": "refresh token revoked" })));
            }
            let auth = request.header("authorization").map(str::to_string);
            self.seen.lock().unwrap().push((request.url.clone(), auth.clone()));
            tokio::task::yield_now().await;
            let status = if auth.as_deref() == Some(self.valid.as_str()) { 200 } else { 401 };
            Ok(ResponseContext::new(status, json!({ "url": request.url })))
        }
    }

    struct Harness {
        auth: Arc<MockAuth>,
        store: Arc<SessionStore>,
        navigator: Arc<HeadlessNavigator>,
        coordinator: Arc<SessionRefreshCoordinator>,
        transport: Arc<Gatekeeper>,
        pipeline: Arc<Pipeline>,
    }

    async fn harness(auth: Arc<MockAuth>, valid: &str) -> Harness {
        let config = SessionConfig {
            retry: RetryConfig { max_attempts: 1, ..RetryConfig::default() },
            ..SessionConfig::default()
        };
        let navigator = Arc::new(HeadlessNavigator::new("/orders"));
        let store = Arc::new(
            SessionStore::new(auth.clone(), &config).with_navigator(navigator.clone()),
        );
        store.login(Credentials::new("ada@example.com", "correct")).await.unwrap();

        let coordinator = SessionRefreshCoordinator::new(Arc::clone(&store));
        let transport = Arc::new(Gatekeeper {
            valid: valid.to_string(),
            seen: StdMutex::new(Vec::new()),
            refresh_hits: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(transport.clone())
            .with_stage(Arc::new(AuthHeaderStage::new(store.clone())), Phase::Request)
            .with_stage(Arc::new(StatusCheckStage), Phase::Response)
            .with_stage(
                Arc::new(SessionRefreshStage::new(Arc::clone(&coordinator), &config)),
                Phase::Error,
            );

        Harness {
            auth,
            store,
            navigator,
            coordinator,
            transport,
            pipeline: Arc::new(pipeline),
        }
    }

    async fn fire(pipeline: &Arc<Pipeline>, paths: &[&str]) -> Vec<Result<ResponseContext, ApiError>> {
        let handles: Vec<_> = paths
            .iter()
            .map(|path| {
                let pipeline = Arc::clone(pipeline);
                let request = RequestContext::get(*path);
                tokio::spawn(async move { pipeline.send(request).await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_401s_share_one_refresh() {
        let refreshed = session_response("r-2", 2_100_000_000);
        let new_bearer = format!("Bearer {}", refreshed.tokens.access_token.as_str());
        let h = harness(MockAuth::slow(Ok(refreshed), Duration::from_millis(500)), &new_bearer).await;

        let results = fire(&h.pipeline, &["/a", "/b", "/c", "/d", "/e"]).await;

        assert!(results.iter().all(|r| r.as_ref().map(|resp| resp.status) == Ok(200)));
        assert_eq!(h.auth.refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.refresh_count(), 1);
        assert!(!h.coordinator.is_refreshing().await);

        // Every request was replayed exactly once, with the new token
        let seen = h.transport.seen.lock().unwrap();
        for path in ["/a", "/b", "/c", "/d", "/e"] {
            let attempts: Vec<_> = seen.iter().filter(|(url, _)| url == path).collect();
            assert_eq!(attempts.len(), 2, "{} attempts", path);
            assert_eq!(attempts[1].1.as_deref(), Some(new_bearer.as_str()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_released_in_arrival_order() {
        let refreshed = session_response("r-2", 2_100_000_000);
        let h = harness(MockAuth::slow(Ok(refreshed), Duration::from_millis(500)), "unused").await;
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let coordinator = Arc::clone(&h.coordinator);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let outcome = coordinator.refresh().await;
                order.lock().unwrap().push(i);
                outcome
            }));
            // Make arrival order deterministic
            while h.coordinator.in_flight.lock().await.as_ref().map(|w| w.len()) != Some(i + 1) {
                tokio::task::yield_now().await;
            }
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(h.coordinator.refresh_count(), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_rejects_all_and_logs_out_once() {
        let h = harness(MockAuth::slow(Err(ApiError::Unauthorized), Duration::from_millis(500)), "never").await;

        let results = fire(&h.pipeline, &["/a", "/b", "/c"]).await;

        assert!(results.iter().all(|r| r.as_ref().err() == Some(&ApiError::SessionExpired)));
        assert_eq!(h.auth.refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!h.store.is_authenticated());
        assert_eq!(h.navigator.history(), vec!["/orders", "/login"]);
        assert_eq!(
            h.store.state().error.as_deref(),
            Some(ApiError::SessionExpired.user_message().as_str())
        );
    }

    #[tokio::test]
    async fn test_refresh_endpoint_401_does_not_refresh() {
        let h = harness(MockAuth::refreshing_to(session_response("r-2", 2_100_000_000)), "never").await;

        let result = h.pipeline.send(RequestContext::post("/auth/refresh", json!({}))).await;

        assert_eq!(result.unwrap_err(), ApiError::SessionExpired);
        assert_eq!(h.transport.refresh_hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(h.auth.refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(h.coordinator.refresh_count(), 0);
        assert!(!h.store.is_authenticated());
        assert_eq!(h.navigator.current_path(), "/login");
    }

    #[tokio::test]
    async fn test_replay_is_attempted_once() {
        // The refreshed token is still rejected: the replay must not refresh again
        let refreshed = session_response("r-2", 2_100_000_000);
        let h = harness(MockAuth::refreshing_to(refreshed), "never").await;

        let result = h.pipeline.send(RequestContext::get("/a")).await;

        let err = result.unwrap_err();
        assert_eq!(err, ApiError::SessionExpired);
        assert_eq!(err.user_message(), "Your session has expired. Please log in again.");
        assert_eq!(h.transport.seen.lock().unwrap().len(), 2);
        assert_eq!(h.coordinator.refresh_count(), 1);
        assert_eq!(h.navigator.history(), vec!["/orders", "/login"]);
    }

    #[tokio::test]
    async fn test_non_401_errors_pass_through() {
        let h = harness(MockAuth::refreshing_to(session_response("r-2", 2_100_000_000)), "never").await;

        struct Forbidden;
        #[async_trait]
        impl Transport for Forbidden {
            async fn send(&self, _request: &RequestContext) -> Result<ResponseContext, ApiError> {
                Ok(ResponseContext::new(403, json!({ "message": "no" })))
            }
        }
        let config = SessionConfig::default();
        let pipeline = Pipeline::new(Arc::new(Forbidden))
            .with_stage(Arc::new(StatusCheckStage), Phase::Response)
            .with_stage(Arc::new(SessionRefreshStage::new(Arc::clone(&h.coordinator), &config)), Phase::Error);

        let err = pipeline.send(RequestContext::get("/admin")).await.unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied(_)));
        assert_eq!(h.coordinator.refresh_count(), 0);
        assert!(h.store.is_authenticated());
    }
}
