//! The session store: single source of truth for who is logged in.
//!
//! State lives in a `watch` channel so views and the refresh scheduler can
//! subscribe to changes. Every mutation goes through a `SessionStore`
//! method; actions persist the durable subset of the state and announce the
//! change to other tabs, while events received from other tabs are applied
//! in memory only.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::token::{AccessToken, RefreshToken, TokenPair, TokenSource};
use super::types::{AuthResponse, Credentials, RegisterData, User};
use crate::api::{ApiError, AuthService};
use crate::config::SessionConfig;
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::storage::KeyValueStorage;
use crate::sync::{CrossTabSync, SyncEvent};

/// Circuit key guarding the refresh endpoint.
pub const REFRESH_CIRCUIT_KEY: &str = "auth.refresh";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub user: Option<User>,
    pub tokens: Option<TokenPair>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    /// User-facing message for the last failure.
    pub error: Option<String>,
    pub has_hydrated: bool,
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn access_token(&self) -> Option<&AccessToken> {
        self.tokens.as_ref().map(|t| &t.access_token)
    }

    pub fn refresh_token(&self) -> Option<&RefreshToken> {
        self.tokens.as_ref().map(|t| &t.refresh_token)
    }

    pub fn has_session(&self) -> bool {
        self.is_authenticated || self.tokens.is_some()
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.token_expires_at.map(|at| at - now)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.time_until_expiry(Utc::now())
            .map(|d| d.num_minutes().max(0))
    }

    fn signed_out(has_hydrated: bool, error: Option<String>) -> Self {
        Self {
            has_hydrated,
            error,
            ..Self::default()
        }
    }
}

/// The durable subset of a `Session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    tokens: Option<TokenPair>,
    #[serde(default)]
    is_authenticated: bool,
}

/// Where the UI is, and how to send it elsewhere.
pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;
    fn redirect_to(&self, path: &str);
}

/// Navigator for environments without a router: remembers the current path
/// and every redirect, and logs them.
#[derive(Debug)]
pub struct HeadlessNavigator {
    history: Mutex<Vec<String>>,
}

impl HeadlessNavigator {
    pub fn new(initial_path: impl Into<String>) -> Self {
        Self {
            history: Mutex::new(vec![initial_path.into()]),
        }
    }

    /// Paths visited, the initial one first.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl Default for HeadlessNavigator {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Navigator for HeadlessNavigator {
    fn current_path(&self) -> String {
        self.history
            .lock()
            .ok()
            .and_then(|h| h.last().cloned())
            .unwrap_or_default()
    }

    fn redirect_to(&self, path: &str) {
        info!(path, "Redirecting");
        if let Ok(mut history) = self.history.lock() {
            history.push(path.to_string());
        }
    }
}

pub struct SessionStore {
    state: watch::Sender<Session>,
    auth: Arc<dyn AuthService>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    storage_key: String,
    login_route: String,
    navigator: Arc<dyn Navigator>,
    sync: Option<Arc<CrossTabSync>>,
    refresh_retry: RetryPolicy,
    refresh_breaker: CircuitBreaker,
}

impl SessionStore {
    pub fn new(auth: Arc<dyn AuthService>, config: &SessionConfig) -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            state,
            auth,
            storage: None,
            storage_key: config.storage_key.clone(),
            login_route: config.login_route.clone(),
            navigator: Arc::new(HeadlessNavigator::default()),
            sync: None,
            refresh_retry: RetryPolicy::new(config.retry.clone()),
            refresh_breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
        }
    }

    /// Persist the session under the configured key and restore it on `hydrate`.
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn with_sync(mut self, sync: Arc<CrossTabSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    // ===== Observation =====

    pub fn state(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated
    }

    pub fn user(&self) -> Option<User> {
        self.state.borrow().user.clone()
    }

    pub fn refresh_circuit(&self) -> &CircuitBreaker {
        &self.refresh_breaker
    }

    // ===== Hydration =====

    /// Restore the persisted session, then mark the store hydrated.
    ///
    /// An unreadable entry is logged and ignored; the store starts signed out.
    pub fn hydrate(&self) {
        if let Some(storage) = &self.storage {
            match self.read_persisted(storage.as_ref()) {
                Ok(Some(persisted)) => {
                    let expires_at = persisted
                        .tokens
                        .as_ref()
                        .map(|t| t.access_token.expires_at_or(Utc::now()));
                    self.state.send_modify(|s| {
                        s.is_authenticated = persisted.is_authenticated && persisted.tokens.is_some();
                        s.user = persisted.user;
                        s.tokens = persisted.tokens;
                        s.token_expires_at = expires_at;
                    });
                    debug!(authenticated = self.is_authenticated(), "Session rehydrated");
                }
                Ok(None) => debug!("No persisted session"),
                Err(e) => warn!(error = %e, "Ignoring unreadable persisted session"),
            }
        }
        self.set_has_hydrated();
    }

    /// Resolve once `has_hydrated` is set.
    pub async fn wait_for_hydration(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|s| s.has_hydrated).await;
    }

    // ===== Setters =====

    /// Flip `has_hydrated` to true. Returns false if it already was.
    pub fn set_has_hydrated(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.has_hydrated {
                false
            } else {
                s.has_hydrated = true;
                true
            }
        })
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.state.send_modify(|s| s.error = Some(message));
    }

    pub fn clear_error(&self) {
        self.state.send_if_modified(|s| s.error.take().is_some());
    }

    // ===== Actions =====

    pub async fn login(&self, credentials: Credentials) -> Result<User, ApiError> {
        self.begin();
        match self.auth.authenticate(&credentials).await {
            Ok(response) => {
                info!(user = %response.user.id, "Logged in");
                Ok(self.establish(response))
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.fail(&e);
                Err(e)
            }
        }
    }

    pub async fn register(&self, data: RegisterData) -> Result<User, ApiError> {
        self.begin();
        match self.auth.register(&data).await {
            Ok(response) => {
                info!(user = %response.user.id, "Registered");
                Ok(self.establish(response))
            }
            Err(e) => {
                warn!(error = %e, "Registration failed");
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// End the session: invalidate remotely if possible, then clear locally,
    /// tell the other tabs and go to the login route.
    pub async fn logout(&self) {
        let refresh_token = self.state.borrow().refresh_token().cloned();
        if let Some(refresh_token) = refresh_token {
            if let Err(e) = self.auth.logout(&refresh_token).await {
                warn!(error = %e, "Remote logout failed, clearing local session anyway");
            }
        }

        self.state
            .send_modify(|s| *s = Session::signed_out(s.has_hydrated, None));
        self.clear_persisted();
        self.broadcast(SyncEvent::Logout);
        info!("Logged out");
        self.redirect_to_login();
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// Transient failures are retried and the endpoint sits behind its own
    /// circuit; a rejected refresh token fails immediately.
    ///
    /// The outcome is applied only if the session still holds the refresh
    /// token that was sent. A session ended meanwhile (locally or by another
    /// tab) stays ended and the caller gets `SessionExpired`.
    pub async fn refresh_token(&self) -> Result<AccessToken, ApiError> {
        let Some(refresh_token) = self.state.borrow().refresh_token().cloned() else {
            return Err(ApiError::NoSession);
        };

        self.begin();
        let auth = &self.auth;
        let refresh_token = &refresh_token;
        let retry = &self.refresh_retry;
        let result = self
            .refresh_breaker
            .execute(REFRESH_CIRCUIT_KEY, move || {
                retry.execute(move || auth.refresh_authentication(refresh_token))
            })
            .await;

        match result {
            Ok(response) => {
                let tokens = response.tokens.clone();
                let expires_at = tokens.access_token.expires_at_or(Utc::now());
                let applied = self.state.send_if_modified(|s| {
                    if s.refresh_token() != Some(refresh_token) {
                        return false;
                    }
                    s.user = Some(response.user);
                    s.tokens = Some(response.tokens);
                    s.is_authenticated = true;
                    s.is_loading = false;
                    s.error = None;
                    s.token_expires_at = Some(expires_at);
                    true
                });
                if !applied {
                    warn!("Session ended during token refresh, discarding new tokens");
                    return Err(ApiError::SessionExpired);
                }
                self.persist();
                let access_token = tokens.access_token.clone();
                self.broadcast(SyncEvent::TokenRefreshed { tokens });
                info!(expires_at = %expires_at, "Token refresh succeeded");
                Ok(access_token)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                if self.holds_refresh_token(refresh_token) {
                    self.fail(&e);
                }
                Err(e)
            }
        }
    }

    fn holds_refresh_token(&self, refresh_token: &RefreshToken) -> bool {
        self.state.borrow().refresh_token() == Some(refresh_token)
    }

    pub async fn get_current_user(&self) -> Result<User, ApiError> {
        let Some(access_token) = self.state.borrow().access_token().cloned() else {
            return Err(ApiError::NoSession);
        };

        self.begin();
        match self.auth.current_user(&access_token).await {
            Ok(user) => {
                self.state.send_modify(|s| {
                    s.user = Some(user.clone());
                    s.is_loading = false;
                });
                self.persist();
                Ok(user)
            }
            Err(e) => {
                warn!(error = %e, "Fetching current user failed");
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Terminal session failure: clear everything, record `reason`, tell the
    /// other tabs and redirect once.
    ///
    /// Idempotent. Returns false when there was no session left to end,
    /// in which case nothing is broadcast and no redirect happens.
    pub fn force_logout(&self, reason: &ApiError) -> bool {
        let message = reason.user_message();
        let acted = self.state.send_if_modified(|s| {
            if !s.has_session() {
                return false;
            }
            *s = Session::signed_out(s.has_hydrated, Some(message.clone()));
            true
        });
        if !acted {
            debug!(reason = %reason, "Session already ended");
            return false;
        }

        warn!(reason = %reason, "Session ended");
        self.clear_persisted();
        self.broadcast(SyncEvent::SessionExpired { message: Some(message) });
        self.redirect_to_login();
        true
    }

    // ===== Cross-tab events =====

    /// Apply a session change announced by another tab.
    ///
    /// Never re-broadcasts and never writes storage: the originating tab
    /// already did both.
    pub fn apply_sync_event(&self, event: SyncEvent) {
        debug!(event = event.kind(), "Applying sync event");
        match event {
            SyncEvent::Login { user, tokens } => {
                let expires_at = tokens.access_token.expires_at_or(Utc::now());
                self.state.send_if_modified(|s| {
                    if s.is_authenticated && s.user.as_ref() == Some(&user) && s.tokens.as_ref() == Some(&tokens) {
                        return false;
                    }
                    s.user = Some(user);
                    s.tokens = Some(tokens);
                    s.is_authenticated = true;
                    s.error = None;
                    s.token_expires_at = Some(expires_at);
                    true
                });
            }
            SyncEvent::TokenRefreshed { tokens } => {
                let expires_at = tokens.access_token.expires_at_or(Utc::now());
                let changed = self.state.send_if_modified(|s| {
                    if !s.is_authenticated || s.tokens.as_ref() == Some(&tokens) {
                        return false;
                    }
                    s.tokens = Some(tokens);
                    s.token_expires_at = Some(expires_at);
                    true
                });
                if !changed {
                    debug!("Refreshed tokens already current or no session, ignoring");
                }
            }
            SyncEvent::Logout => {
                self.state
                    .send_if_modified(|s| Self::end_remotely(s, None));
                self.redirect_to_login();
            }
            SyncEvent::SessionExpired { message } => {
                self.state
                    .send_if_modified(|s| Self::end_remotely(s, message));
                self.redirect_to_login();
            }
        }
    }

    fn end_remotely(s: &mut Session, message: Option<String>) -> bool {
        if !s.has_session() {
            return false;
        }
        *s = Session::signed_out(s.has_hydrated, message);
        true
    }

    // ===== Internals =====

    fn begin(&self) {
        self.state.send_modify(|s| {
            s.is_loading = true;
            s.error = None;
        });
    }

    fn fail(&self, error: &ApiError) {
        let message = error.user_message();
        self.state.send_modify(|s| {
            s.is_loading = false;
            s.is_authenticated = false;
            s.error = Some(message);
        });
    }

    fn establish(&self, response: AuthResponse) -> User {
        let AuthResponse { user, tokens } = response;
        let expires_at = tokens.access_token.expires_at_or(Utc::now());
        self.state.send_modify(|s| {
            s.user = Some(user.clone());
            s.tokens = Some(tokens.clone());
            s.is_authenticated = true;
            s.is_loading = false;
            s.error = None;
            s.token_expires_at = Some(expires_at);
        });
        self.persist();
        self.broadcast(SyncEvent::Login {
            user: user.clone(),
            tokens,
        });
        user
    }

    fn broadcast(&self, event: SyncEvent) {
        if let Some(sync) = &self.sync {
            sync.broadcast(event);
        }
    }

    fn redirect_to_login(&self) {
        if self.navigator.current_path() != self.login_route {
            self.navigator.redirect_to(&self.login_route);
        }
    }

    fn read_persisted(&self, storage: &dyn KeyValueStorage) -> anyhow::Result<Option<PersistedSession>> {
        match storage.get(&self.storage_key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let persisted = {
            let s = self.state.borrow();
            PersistedSession {
                user: s.user.clone(),
                tokens: s.tokens.clone(),
                is_authenticated: s.is_authenticated,
            }
        };
        let result = serde_json::to_string(&persisted)
            .map_err(anyhow::Error::from)
            .and_then(|json| storage.set(&self.storage_key, &json));
        if let Err(e) = result {
            warn!(key = %self.storage_key, error = %e, "Failed to persist session");
        }
    }

    fn clear_persisted(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove(&self.storage_key) {
                warn!(key = %self.storage_key, error = %e, "Failed to clear persisted session");
            }
        }
    }
}

impl TokenSource for SessionStore {
    fn access_token(&self) -> Option<AccessToken> {
        self.state.borrow().access_token().cloned()
    }
}
