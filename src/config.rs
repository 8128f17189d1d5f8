//! Configuration for editorial-sync

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::decorator::DEFAULT_DEBOUNCE;
use crate::error::{Result, SyncError};
use crate::session::correlator::DEFAULT_SUBSCRIPTION_BUFFER;
use crate::session::{BackoffPolicy, SessionConfig};

/// Configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub reconnect: ReconnectSection,

    #[serde(default)]
    pub decorators: DecoratorSection,
}

/// Socket and repository endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    /// Socket base URL; the one-time token is appended
    #[serde(default = "default_socket_url")]
    pub socket_url: String,

    /// Repository HTTP base URL
    #[serde(default = "default_repository_url")]
    pub repository_url: String,

    /// Path of the socket token endpoint under `repository_url`
    #[serde(default = "default_token_path")]
    pub token_path: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Push events held per document set until a subscriber attaches
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

/// Reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoratorSection {
    /// Quiet period before decorators run (0 = next tick)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

fn default_socket_url() -> String {
    "ws://localhost:1080/websocket".to_string()
}

fn default_repository_url() -> String {
    "http://localhost:1080".to_string()
}

fn default_token_path() -> String {
    "/websocket/get-token".to_string()
}

fn default_connect_timeout() -> u64 {
    15_000
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_subscription_buffer() -> usize {
    DEFAULT_SUBSCRIPTION_BUFFER
}

fn default_initial_delay() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_debounce() -> u64 {
    DEFAULT_DEBOUNCE.as_millis() as u64
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            socket_url: default_socket_url(),
            repository_url: default_repository_url(),
            token_path: default_token_path(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for DecoratorSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
        }
    }
}

impl SyncConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| SyncError::Config(format!("Failed to write config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.socket_url.is_empty() {
            return Err(SyncError::Config("session.socket_url is empty".into()));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(SyncError::Config(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                self.reconnect.multiplier
            )));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(SyncError::Config(
                "reconnect.max_delay_ms is below reconnect.initial_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.reconnect.initial_delay_ms),
            multiplier: self.reconnect.multiplier,
            max: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            base_url: self.session.socket_url.clone(),
            request_timeout: Duration::from_millis(self.session.request_timeout_ms),
            backoff: self.backoff_policy(),
            subscription_buffer: self.session.subscription_buffer,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.session.connect_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.decorators.debounce_ms)
    }
}
