//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, Result};

/// Configuration for the chat hub server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Route that accepts the WebSocket upgrade.
    pub ws_path: String,
    /// Maximum concurrent chat connections.
    pub max_connections: usize,
    /// Capacity of the shared inbound command queue.
    pub queue_capacity: usize,
    /// Per-connection outbound buffer. A full buffer counts as a failed write.
    pub send_queue_capacity: usize,
    /// Upper bound on a single socket write.
    pub write_timeout_ms: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a peer after this many seconds without any inbound frame.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Accepted `Origin` values. Empty accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Request header carrying the upstream-authenticated display name.
    pub identity_header: String,
    /// Text sent to each new connection. Empty disables the greeting.
    pub greeting: String,
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            ws_path: "/ts".into(),
            max_connections: 256,
            queue_capacity: 1024,
            send_queue_capacity: 64,
            write_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            allowed_origins: Vec::new(),
            identity_header: "x-authenticated-user".into(),
            greeting: "chatroom handler upgrade".into(),
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// `None` when the greeting is disabled.
    pub fn greeting_text(&self) -> Option<&str> {
        Some(self.greeting.as_str()).filter(|g| !g.is_empty())
    }

    /// Reject configurations the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "ws_path must start with '/': {}",
                self.ws_path
            )));
        }
        if self.ws_path == "/health" {
            return Err(ConfigError::InvalidValue("ws_path collides with /health".into()));
        }
        for (name, value) in [
            ("max_connections", self.max_connections),
            ("queue_capacity", self.queue_capacity),
            ("send_queue_capacity", self.send_queue_capacity),
            ("max_message_size", self.max_message_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{name} must be at least 1")));
            }
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("write_timeout_ms must be at least 1".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(format!(
                "heartbeat_timeout_secs ({}) is shorter than heartbeat_interval_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        axum::http::HeaderName::from_bytes(self.identity_header.as_bytes()).map_err(|_| {
            ConfigError::InvalidValue(format!(
                "identity_header is not a valid header name: {}",
                self.identity_header
            ))
        })?;
        Ok(())
    }
}
