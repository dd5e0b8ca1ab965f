//! Session layer configuration.
//!
//! Endpoints, storage keys, the sync channel name and resilience settings.
//! Every field has a default; a JSON file at
//! `~/.config/sessionward/config.json` overrides any subset of them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "sessionward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Auth service endpoint paths, relative to the API base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEndpoints {
    pub login: String,
    pub register: String,
    pub refresh: String,
    pub logout: String,
    pub current_user: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_string(),
            register: "/auth/register".to_string(),
            refresh: "/auth/refresh".to_string(),
            logout: "/auth/logout".to_string(),
            current_user: "/auth/me".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveRefreshConfig {
    pub enabled: bool,
    /// Fraction of the remaining token lifetime to wait before refreshing.
    pub lifetime_fraction: f64,
    pub min_jitter_secs: u64,
    pub max_jitter_secs: u64,
}

impl Default for ProactiveRefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lifetime_fraction: 0.75,
            min_jitter_secs: 5,
            max_jitter_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub endpoints: AuthEndpoints,
    /// Route the UI is sent to on logout or session expiry.
    pub login_route: String,
    /// Persist the session to durable storage and rehydrate on startup.
    pub persist: bool,
    pub storage_key: String,
    pub sync_channel: String,
    /// Sentinel key used when no broadcast channel is available.
    pub sync_storage_key: String,
    pub request_timeout_ms: u64,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub proactive_refresh: ProactiveRefreshConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            endpoints: AuthEndpoints::default(),
            login_route: "/login".to_string(),
            persist: true,
            storage_key: "auth-storage".to_string(),
            sync_channel: "auth-sync".to_string(),
            sync_storage_key: "auth-sync-event".to_string(),
            request_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            proactive_refresh: ProactiveRefreshConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load from the default config path, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Absolute URL of an endpoint path.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }

    /// Whether `url` points at the refresh endpoint, absolute or relative.
    pub fn is_refresh_url(&self, url: &str) -> bool {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        path == self.endpoints.refresh || path == self.endpoint_url(&self.endpoints.refresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"api_base_url": "https://api.example.com", "retry": {"max_attempts": 5}}"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delay_ms, RetryConfig::default().delay_ms);
        assert_eq!(config.endpoints.refresh, "/auth/refresh");
        assert!(config.persist);
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_load_from_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SessionConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_is_refresh_url() {
        let config = SessionConfig {
            api_base_url: "https://api.example.com/".to_string(),
            ..SessionConfig::default()
        };
        assert!(config.is_refresh_url("/auth/refresh"));
        assert!(config.is_refresh_url("https://api.example.com/auth/refresh"));
        assert!(config.is_refresh_url("https://api.example.com/auth/refresh?x=1"));
        assert!(!config.is_refresh_url("https://api.example.com/auth/refresh-status"));
        assert!(!config.is_refresh_url("/users"));
    }
}
