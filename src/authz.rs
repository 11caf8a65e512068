//! Authorization service boundary
//!
//! The gateway delegates authorization to an external collaborator: given a
//! session id, a bearer credential, and a requested action set, it answers
//! with approved/denied actions and a resolved user identity. Calls use a
//! fixed timeout and are never retried; a timeout closes the connection.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Actions every real-time participant needs; substituted into the request
/// regardless of what the client asked for
pub const REQUIRED_ACTIONS: [&str; 3] = ["CREATE", "READ", "UPDATE"];

/// What the gateway asks the authorization service about
#[derive(Debug, Clone, Serialize)]
pub struct AccessRequest {
    #[serde(rename = "session")]
    pub script: i64,
    pub token: String,
    pub actions: Vec<String>,
}

impl AccessRequest {
    /// Build a request carrying the fixed required action set
    pub fn new(script: i64, token: String) -> Self {
        Self {
            script,
            token,
            actions: REQUIRED_ACTIONS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Authorization service verdict
#[derive(Debug, Clone, Deserialize)]
pub struct Permissions {
    pub approved: Vec<String>,
    pub denied: Vec<String>,
    /// Resolved user identity
    pub user: i64,
}

/// External authorization collaborator
#[async_trait]
pub trait Authorize: Send + Sync {
    async fn authorize(&self, request: &AccessRequest) -> Result<Permissions, AuthzError>;
}

/// Authorization failure
#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("authorization service timed out")]
    Timeout,
    #[error("authorization service unreachable: {0}")]
    Upstream(String),
}

/// HTTP client for the authorization collaborator
pub struct HttpAuthorizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAuthorizer {
    /// `base_url` is the collaborator's root; the authorize call posts to
    /// `{base_url}/scripts/authorize`
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("scriptcast")
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/scripts/authorize", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Authorize for HttpAuthorizer {
    async fn authorize(&self, request: &AccessRequest) -> Result<Permissions, AuthzError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthzError::Timeout
                } else {
                    AuthzError::Upstream(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthzError::Denied(if body.is_empty() {
                "permission denied".to_string()
            } else {
                body
            }));
        }

        let permissions: Permissions = response
            .json()
            .await
            .map_err(|e| AuthzError::Upstream(e.to_string()))?;

        debug!(
            session = request.script,
            user = permissions.user,
            approved = permissions.approved.len(),
            denied = permissions.denied.len(),
            "authorization verdict"
        );
        Ok(permissions)
    }
}
