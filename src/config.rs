//! Scriptcast configuration
//!
//! Configuration comes from environment variables. Worker nodes are assumed
//! pre-registered: the memory backend reads them from `WORKER_NODES`, the
//! postgres backend from the `worker_nodes` table.

use std::time::Duration;

/// Scriptcast configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the HTTP/WebSocket server (default: 0.0.0.0:3000)
    pub listen_addr: String,
    /// Base URL of the authorization collaborator
    pub authz_url: String,
    /// Heartbeat tick interval (default: 500 ms)
    pub heartbeat_interval: Duration,
    /// Inactivity deadline before a connection is closed (default: 5 s)
    pub activity_timeout: Duration,
    /// Heartbeat ticks an unauthenticated connection may survive (default: 5)
    pub auth_deadline_ticks: u32,
    /// Max subscriptions one physical broker connection carries (default: 100)
    pub subscription_threshold: usize,
    /// Per-subscription receive buffer depth (default: 32)
    pub receive_buffer: usize,
    /// Timeout for authorization/assignment collaborator calls (default: 5 s)
    pub upstream_timeout: Duration,
    /// Pre-registered worker nodes as `id=addr` pairs (memory backend)
    pub worker_nodes: Vec<(i64, String)>,
    /// PostgreSQL connection string (postgres backend)
    pub database_url: Option<String>,
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr =
            std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let authz_url = std::env::var("INTERNAL_SERVICE")
            .map_err(|_| ConfigError::MissingEnv("INTERNAL_SERVICE"))?;

        let worker_nodes = match std::env::var("WORKER_NODES") {
            Ok(raw) => parse_worker_nodes(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            listen_addr,
            authz_url,
            heartbeat_interval: duration_env("HEARTBEAT_INTERVAL_MS", 500)?,
            activity_timeout: duration_env("ACTIVITY_TIMEOUT_MS", 5000)?,
            auth_deadline_ticks: parse_env("AUTH_DEADLINE_TICKS", 5)?,
            subscription_threshold: parse_env("SUBSCRIPTION_THRESHOLD", 100)?,
            receive_buffer: parse_env("RECEIVE_BUFFER", 32)?,
            upstream_timeout: duration_env("UPSTREAM_TIMEOUT_MS", 5000)?,
            worker_nodes,
            database_url: std::env::var("DATABASE_URL").ok(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            authz_url: String::new(),
            heartbeat_interval: Duration::from_millis(500),
            activity_timeout: Duration::from_secs(5),
            auth_deadline_ticks: 5,
            subscription_threshold: 100,
            receive_buffer: 32,
            upstream_timeout: Duration::from_secs(5),
            worker_nodes: Vec::new(),
            database_url: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidEnv(name, "could not parse value")),
        Err(_) => Ok(default),
    }
}

fn duration_env(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    parse_env(name, default_ms).map(Duration::from_millis)
}

/// Parse `id=addr` pairs, comma separated: `1=10.0.0.1:6379,2=10.0.0.2:6379`
fn parse_worker_nodes(raw: &str) -> Result<Vec<(i64, String)>, ConfigError> {
    let mut nodes = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let (id, addr) = pair
            .split_once('=')
            .ok_or(ConfigError::InvalidEnv("WORKER_NODES", "expected id=addr"))?;
        let id: i64 = id
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv("WORKER_NODES", "node id must be an integer"))?;
        if addr.trim().is_empty() {
            return Err(ConfigError::InvalidEnv("WORKER_NODES", "empty node address"));
        }

        nodes.push((id, addr.trim().to_string()));
    }

    Ok(nodes)
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
