//! Wiring for one tab.
//!
//! `SessionRuntime` assembles the storage, session store, cross-tab sync,
//! refresh coordinator, request pipeline and proactive scheduler, hydrates
//! the session and starts the background tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{ApiClient, AuthService, HttpAuthService, ReqwestTransport, Transport};
use crate::auth::{
    Navigator, ProactiveRefreshScheduler, SessionRefreshCoordinator, SessionRefreshStage, SessionStore,
};
use crate::config::SessionConfig;
use crate::pipeline::{AuthHeaderStage, LoggingStage, Phase, Pipeline, RequestShapingStage, Stage, StatusCheckStage};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::storage::{KeyValueStorage, ObservableStorage};
use crate::sync::{select_broadcaster, BroadcastHub, CrossTabSync, TabId};

pub struct SessionRuntimeBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    auth: Option<Arc<dyn AuthService>>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    shared_storage: Option<Arc<dyn ObservableStorage>>,
    hub: Option<BroadcastHub>,
    navigator: Option<Arc<dyn Navigator>>,
    tab_id: Option<TabId>,
}

impl SessionRuntimeBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn auth_service(mut self, auth: Arc<dyn AuthService>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Durable storage private to this tab.
    pub fn storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Storage shared with the other tabs; also usable as the sync fallback.
    pub fn shared_storage<S: ObservableStorage + 'static>(mut self, storage: Arc<S>) -> Self {
        let private: Arc<dyn KeyValueStorage> = storage.clone();
        let shared: Arc<dyn ObservableStorage> = storage;
        self.storage = Some(private);
        self.shared_storage = Some(shared);
        self
    }

    pub fn broadcast_hub(mut self, hub: BroadcastHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn tab_id(mut self, tab_id: TabId) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    /// Assemble and start the runtime. Must be called within a tokio runtime.
    pub fn start(self) -> Result<SessionRuntime> {
        let config = self.config;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::new(config.request_timeout()).context("Failed to build HTTP transport")?,
            ),
        };
        let auth: Arc<dyn AuthService> = match self.auth {
            Some(auth) => auth,
            None => Arc::new(HttpAuthService::new(Arc::clone(&transport), &config)),
        };
        let tab_id = self.tab_id.unwrap_or_else(TabId::random);

        let sync = select_broadcaster(self.hub.as_ref(), self.shared_storage, &config)
            .map(|broadcaster| Arc::new(CrossTabSync::new(tab_id.clone(), broadcaster)));

        let mut store = SessionStore::new(auth, &config);
        if config.persist {
            if let Some(storage) = self.storage {
                store = store.with_storage(storage);
            }
        }
        if let Some(navigator) = self.navigator {
            store = store.with_navigator(navigator);
        }
        if let Some(sync) = &sync {
            store = store.with_sync(Arc::clone(sync));
        }
        let store = Arc::new(store);
        store.hydrate();

        let listener = sync.as_ref().map(|sync| sync.listen(Arc::clone(&store)));
        let coordinator = SessionRefreshCoordinator::new(Arc::clone(&store));

        let logging: Arc<dyn Stage> = Arc::new(LoggingStage);
        let pipeline = Pipeline::new(transport)
            .with_timeout(config.request_timeout())
            .with_stage(Arc::new(RequestShapingStage::new(&config.api_base_url)), Phase::Request)
            .with_stage(Arc::new(AuthHeaderStage::new(store.clone())), Phase::Request)
            .with_stage(Arc::clone(&logging), Phase::Request)
            .with_stage(Arc::new(StatusCheckStage), Phase::Response)
            .with_stage(Arc::clone(&logging), Phase::Response)
            .with_stage(
                Arc::new(SessionRefreshStage::new(Arc::clone(&coordinator), &config)),
                Phase::Error,
            )
            .with_stage(logging, Phase::Error);
        let client = ApiClient::new(
            Arc::new(pipeline),
            CircuitBreaker::new(config.circuit_breaker.clone()),
            RetryPolicy::new(config.retry.clone()),
        );

        let scheduler = ProactiveRefreshScheduler::start(Arc::clone(&coordinator), config.proactive_refresh.clone());

        info!(
            tab = %tab_id,
            sync = sync.is_some(),
            authenticated = store.is_authenticated(),
            "Session runtime started"
        );

        Ok(SessionRuntime {
            config,
            tab_id,
            store,
            coordinator,
            client,
            listener,
            scheduler,
        })
    }
}

pub struct SessionRuntime {
    config: SessionConfig,
    tab_id: TabId,
    store: Arc<SessionStore>,
    coordinator: Arc<SessionRefreshCoordinator>,
    client: ApiClient,
    listener: Option<JoinHandle<()>>,
    scheduler: ProactiveRefreshScheduler,
}

impl SessionRuntime {
    pub fn builder(config: SessionConfig) -> SessionRuntimeBuilder {
        SessionRuntimeBuilder {
            config,
            transport: None,
            auth: None,
            storage: None,
            shared_storage: None,
            hub: None,
            navigator: None,
            tab_id: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<SessionRefreshCoordinator> {
        &self.coordinator
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Stop the sync listener and the refresh timer.
    pub fn shutdown(&mut self) {
        self.scheduler.stop();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        debug!(tab = %self.tab_id, "Session runtime stopped");
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
