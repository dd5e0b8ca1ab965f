//! The remote authentication service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{ApiError, Transport};
use crate::auth::{AccessToken, AuthResponse, Credentials, RefreshToken, RegisterData, User};
use crate::config::{AuthEndpoints, SessionConfig};
use crate::pipeline::{LoggingStage, Phase, Pipeline, RequestContext, RequestShapingStage, StatusCheckStage, Stage};

/// Domain auth operations the session store depends on.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthResponse, ApiError>;

    async fn register(&self, data: &RegisterData) -> Result<AuthResponse, ApiError>;

    async fn refresh_authentication(&self, refresh_token: &RefreshToken) -> Result<AuthResponse, ApiError>;

    /// Invalidate the refresh token server-side.
    async fn logout(&self, refresh_token: &RefreshToken) -> Result<(), ApiError>;

    async fn current_user(&self, access_token: &AccessToken) -> Result<User, ApiError>;
}

/// `AuthService` over HTTP.
///
/// Runs on its own pipeline without auth-header or refresh stages: these
/// calls carry their credentials explicitly, and a 401 here is an answer,
/// not something to recover from.
pub struct HttpAuthService {
    pipeline: Pipeline,
    endpoints: AuthEndpoints,
}

impl HttpAuthService {
    pub fn new(transport: Arc<dyn Transport>, config: &SessionConfig) -> Self {
        let logging: Arc<dyn Stage> = Arc::new(LoggingStage);
        let pipeline = Pipeline::new(transport)
            .with_timeout(config.request_timeout())
            .with_stage(Arc::new(RequestShapingStage::new(&config.api_base_url)), Phase::Request)
            .with_stage(Arc::clone(&logging), Phase::Request)
            .with_stage(Arc::new(StatusCheckStage), Phase::Response)
            .with_stage(Arc::clone(&logging), Phase::Response)
            .with_stage(logging, Phase::Error);

        Self {
            pipeline,
            endpoints: config.endpoints.clone(),
        }
    }

    async fn post_for_session(&self, path: &str, body: serde_json::Value) -> Result<AuthResponse, ApiError> {
        let request = RequestContext::post(path, body).without_auth();
        let response = self.pipeline.send(request).await?;
        response.json()
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthResponse, ApiError> {
        debug!(email = %credentials.email, "Authenticating");
        self.post_for_session(&self.endpoints.login, json!(credentials)).await
    }

    async fn register(&self, data: &RegisterData) -> Result<AuthResponse, ApiError> {
        debug!(email = %data.email, "Registering");
        self.post_for_session(&self.endpoints.register, json!(data)).await
    }

    async fn refresh_authentication(&self, refresh_token: &RefreshToken) -> Result<AuthResponse, ApiError> {
        self.post_for_session(
            &self.endpoints.refresh,
            json!({ "refreshToken": refresh_token.as_str() }),
        )
        .await
    }

    async fn logout(&self, refresh_token: &RefreshToken) -> Result<(), ApiError> {
        let request = RequestContext::post(
            self.endpoints.logout.as_str(),
            json!({ "refreshToken": refresh_token.as_str() }),
        )
        .without_auth();
        self.pipeline.send(request).await?;
        Ok(())
    }

    async fn current_user(&self, access_token: &AccessToken) -> Result<User, ApiError> {
        let request = RequestContext::get(self.endpoints.current_user.as_str())
            .with_header("authorization", format!("Bearer {}", access_token.as_str()));
        let response = self.pipeline.send(request).await?;
        response.json()
    }
}
