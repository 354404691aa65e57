//! Client configuration
//!
//! Timing knobs live here instead of in process-wide globals so tests can
//! shrink the pairing poll and the session lifetime per client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API base URL, e.g. `http://192.0.2.1/api/v8/`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Application identity registered during pairing
    pub app_id: Option<String>,

    /// Long-lived token returned by pairing
    pub private_token: Option<String>,

    /// Timeout for plain HTTP calls in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// Pairing and session timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay between two pairing status polls
    #[serde(default = "default_retry_delay")]
    pub authorize_retry_delay_ms: u64,

    /// Hard deadline for the whole pairing poll loop
    #[serde(default = "default_authorize_timeout")]
    pub authorize_timeout_ms: u64,

    /// Session lifetime, fixed by the device
    #[serde(default = "default_session_ttl")]
    pub session_ttl_ms: u64,
}

// Default value functions
fn default_base_url() -> String {
    crate::DEFAULT_BASE_URL.to_string()
}
fn default_request_timeout() -> u64 {
    30_000
}
fn default_retry_delay() -> u64 {
    5_000 // 5 seconds
}
fn default_authorize_timeout() -> u64 {
    300_000 // 5 minutes
}
fn default_session_ttl() -> u64 {
    1_800_000 // 30 minutes
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            authorize_retry_delay_ms: default_retry_delay(),
            authorize_timeout_ms: default_authorize_timeout(),
            session_ttl_ms: default_session_ttl(),
        }
    }
}

impl TimingConfig {
    pub fn authorize_retry_delay(&self) -> Duration {
        Duration::from_millis(self.authorize_retry_delay_ms)
    }

    pub fn authorize_timeout(&self) -> Duration {
        Duration::from_millis(self.authorize_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            app_id: None,
            private_token: None,
            request_timeout_ms: default_request_timeout(),
            timing: TimingConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_private_token(mut self, token: impl Into<String>) -> Self {
        self.private_token = Some(token.into());
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse a config from an in-memory TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}
