//! Repository collaborator
//!
//! The repository issues a one-time socket token for every physical connect,
//! including reconnects. Access-token acquisition itself happens elsewhere.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Issues one-time socket tokens.
#[async_trait]
pub trait SocketTokenSource: Send + Sync + 'static {
    async fn socket_token(&self, access_token: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct SocketTokenResponse {
    token: String,
}

/// Socket token source backed by the repository's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTokenSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenSource {
    /// Create a token source for `repository_url`, requesting tokens from
    /// `token_path` (e.g. `/websocket/get-token`).
    pub fn new(repository_url: &str, token_path: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: join_url(repository_url, token_path),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SocketTokenSource for HttpTokenSource {
    async fn socket_token(&self, access_token: &str) -> Result<String> {
        debug!(endpoint = %self.endpoint, "Requesting socket token");

        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::Repository(format!(
                "Socket token request failed ({}): {}",
                status.as_u16(),
                message
            )));
        }

        let body: SocketTokenResponse = response.json().await?;
        if body.token.is_empty() {
            return Err(SyncError::Repository("Empty socket token".into()));
        }
        Ok(body.token)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
