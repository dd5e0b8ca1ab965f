//! Two tabs of one origin sharing storage and a broadcast hub, talking to
//! an in-memory auth server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use sessionward_core::api::Transport;
use sessionward_core::auth::{encode_unsigned, HeadlessNavigator, Navigator};
use sessionward_core::pipeline::{RequestContext, ResponseContext};
use sessionward_core::storage::{KeyValueStorage, MemoryStorage};
use sessionward_core::sync::{BroadcastHub, SyncEvent, TabId};
use sessionward_core::{ApiError, Credentials, SessionConfig, SessionRuntime};

#[derive(Default)]
struct ServerState {
    generation: u32,
    valid_access: String,
    hits: HashMap<String, u32>,
}

/// Issues one access token per generation; only the latest is accepted.
#[derive(Default)]
struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    fn issue(state: &mut ServerState) -> Value {
        state.generation += 1;
        let exp = chrono::Utc::now().timestamp() + 3600 + state.generation as i64;
        let access = format!("{}sig", encode_unsigned(&json!({ "sub": "u-1", "exp": exp })));
        state.valid_access = access.clone();
        json!({
            "accessToken": access,
            "refreshToken": format!("refresh-{}", state.generation),
            "user": { "id": "u-1", "email": "ada@example.com", "name": "Ada" }
        })
    }

    /// Invalidate the current access token, as if it had expired server-side.
    fn expire_access_token(&self) {
        self.state.lock().unwrap().valid_access = "expired".to_string();
    }

    fn hits(&self, path: &str) -> u32 {
        self.state.lock().unwrap().hits.get(path).copied().unwrap_or(0)
    }

    fn total_hits(&self) -> u32 {
        self.state.lock().unwrap().hits.values().sum()
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, request: &RequestContext) -> Result<ResponseContext, ApiError> {
        let path = request
            .url
            .split("/api")
            .nth(1)
            .unwrap_or(request.url.as_str())
            .to_string();
        let mut state = self.state.lock().unwrap();
        *state.hits.entry(path.clone()).or_default() += 1;

        let bearer_ok = request.header("authorization") == Some(format!("Bearer {}", state.valid_access).as_str());
        let (status, body) = match path.as_str() {
            "/auth/login" => {
                let body = request.body.clone().unwrap_or(Value::Null);
                if body["password"] == json!("correct") {
                    (200, Self::issue(&mut state))
                } else {
                    (401, json!({ "message": "bad credentials" }))
                }
            }
            "/auth/refresh" => (200, Self::issue(&mut state)),
            "/auth/logout" => (204, Value::Null),
            _ if bearer_ok => (200, json!({ "orders": [1, 2, 3] })),
            _ => (401, json!({ "message": "token expired" })),
        };
        Ok(ResponseContext::new(status, body))
    }
}

struct Tab {
    runtime: SessionRuntime,
    navigator: Arc<HeadlessNavigator>,
}

fn open_tab(server: &Arc<FakeServer>, storage: &Arc<MemoryStorage>, hub: &BroadcastHub, id: &str, path: &str) -> Tab {
    let navigator = Arc::new(HeadlessNavigator::new(path));
    let runtime = SessionRuntime::builder(SessionConfig::default())
        .transport(server.clone())
        .shared_storage(Arc::clone(storage))
        .broadcast_hub(hub.clone())
        .navigator(navigator.clone())
        .tab_id(TabId::new(id))
        .start()
        .unwrap();
    Tab { runtime, navigator }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_login_and_logout_follow_across_tabs() {
    let server = Arc::new(FakeServer::default());
    let storage = Arc::new(MemoryStorage::new());
    let hub = BroadcastHub::new();
    let a = open_tab(&server, &storage, &hub, "a", "/login");
    let b = open_tab(&server, &storage, &hub, "b", "/dashboard");

    a.runtime
        .store()
        .login(Credentials::new("ada@example.com", "correct"))
        .await
        .unwrap();
    settle().await;

    let b_state = b.runtime.store().state();
    assert!(b_state.is_authenticated);
    assert_eq!(b_state.tokens, a.runtime.store().state().tokens);
    assert!(storage.get("auth-storage").unwrap().is_some());

    let before = server.total_hits();
    a.runtime.store().logout().await;
    settle().await;

    assert!(!b.runtime.store().is_authenticated());
    assert_eq!(b.navigator.current_path(), "/login");
    assert_eq!(server.hits("/auth/logout"), 1);
    // Only A's logout call reached the server
    assert_eq!(server.total_hits(), before + 1);
    assert_eq!(storage.get("auth-storage").unwrap(), None);
}

#[tokio::test]
async fn test_401_recovery_refreshes_once_and_updates_other_tab() {
    let server = Arc::new(FakeServer::default());
    let storage = Arc::new(MemoryStorage::new());
    let hub = BroadcastHub::new();
    let a = open_tab(&server, &storage, &hub, "a", "/orders");
    let b = open_tab(&server, &storage, &hub, "b", "/orders");

    a.runtime
        .store()
        .login(Credentials::new("ada@example.com", "correct"))
        .await
        .unwrap();
    settle().await;
    server.expire_access_token();

    let orders: Value = a.runtime.client().get("/orders").await.unwrap();
    settle().await;

    assert_eq!(orders["orders"], json!([1, 2, 3]));
    assert_eq!(server.hits("/auth/refresh"), 1);
    assert_eq!(server.hits("/orders"), 2);
    assert_eq!(a.runtime.coordinator().refresh_count(), 1);

    let a_tokens = a.runtime.store().state().tokens.unwrap();
    assert_eq!(a_tokens.refresh_token.as_str(), "refresh-2");
    assert_eq!(b.runtime.store().state().tokens, Some(a_tokens));
    assert_eq!(a.navigator.history(), vec!["/orders"]);
}

#[tokio::test]
async fn test_identical_token_refresh_leaves_receiver_unchanged() {
    let server = Arc::new(FakeServer::default());
    let storage = Arc::new(MemoryStorage::new());
    let hub = BroadcastHub::new();
    let a = open_tab(&server, &storage, &hub, "a", "/");
    let b = open_tab(&server, &storage, &hub, "b", "/");

    a.runtime
        .store()
        .login(Credentials::new("ada@example.com", "correct"))
        .await
        .unwrap();
    settle().await;

    let mut rx = b.runtime.store().subscribe();
    rx.borrow_and_update();
    let tokens = a.runtime.store().state().tokens.unwrap();
    b.runtime
        .store()
        .apply_sync_event(SyncEvent::TokenRefreshed { tokens });

    assert!(!rx.has_changed().unwrap());
}

#[tokio::test]
async fn test_late_tab_hydrates_once_from_shared_storage() {
    let server = Arc::new(FakeServer::default());
    let storage = Arc::new(MemoryStorage::new());
    let hub = BroadcastHub::new();
    let a = open_tab(&server, &storage, &hub, "a", "/");
    a.runtime
        .store()
        .login(Credentials::new("ada@example.com", "correct"))
        .await
        .unwrap();

    let c = open_tab(&server, &storage, &hub, "c", "/");
    c.runtime.store().wait_for_hydration().await;

    let state = c.runtime.store().state();
    assert!(state.has_hydrated);
    assert!(state.is_authenticated);
    assert_eq!(state.user.map(|u| u.display_name().to_string()).as_deref(), Some("Ada"));
    assert!(!c.runtime.store().set_has_hydrated());
}

#[tokio::test]
async fn test_storage_event_fallback_without_hub() {
    let server = Arc::new(FakeServer::default());
    let storage = Arc::new(MemoryStorage::new());
    let open = |id: &str| {
        let navigator = Arc::new(HeadlessNavigator::new("/dashboard"));
        let runtime = SessionRuntime::builder(SessionConfig::default())
            .transport(server.clone())
            .shared_storage(Arc::clone(&storage))
            .navigator(navigator.clone())
            .tab_id(TabId::new(id))
            .start()
            .unwrap();
        Tab { runtime, navigator }
    };
    let a = open("a");
    let b = open("b");

    a.runtime
        .store()
        .login(Credentials::new("ada@example.com", "correct"))
        .await
        .unwrap();
    settle().await;
    assert!(b.runtime.store().is_authenticated());

    a.runtime.store().force_logout(&ApiError::SessionExpired);
    settle().await;
    assert!(!b.runtime.store().is_authenticated());
    assert_eq!(b.navigator.current_path(), "/login");
    assert_eq!(
        b.runtime.store().state().error.as_deref(),
        Some(ApiError::SessionExpired.user_message().as_str())
    );
}
