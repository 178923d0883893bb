//! Settings types.
//!
//! All structs use `#[serde(default)]` so a settings file only needs the keys
//! it overrides. Durations are stored as milliseconds and exposed as
//! [`Duration`] through accessor methods.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// Subscriber server settings.
    pub server: ServerSettings,
    /// Publisher client settings.
    pub client: ClientSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl FanoutSettings {
    /// Check cross-field and range constraints.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.client.validate()
    }
}

/// Subscriber server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Path of the subscriber WebSocket endpoint.
    pub endpoint_path: String,
    /// Path of the ingest WebSocket endpoint; `None` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_path: Option<String>,
    /// Upper bound on handing one frame to one connection.
    pub send_timeout_ms: u64,
    /// How long to wait for the peer to finish the close handshake.
    pub close_timeout_ms: u64,
    /// Interval between server pings.
    pub heartbeat_interval_ms: u64,
    /// Close a connection that has not answered pings for this long.
    pub heartbeat_timeout_ms: u64,
    /// Capacity of each connection's outbound queue.
    pub send_queue_capacity: usize,
    /// Maximum concurrent subscriber connections.
    pub max_connections: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Grace period for in-flight sessions during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            endpoint_path: "/ws/value-change".to_string(),
            ingest_path: Some("/ws/ingest".to_string()),
            send_timeout_ms: 5_000,
            close_timeout_ms: 3_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            send_queue_capacity: 256,
            max_connections: 1_024,
            max_message_size: 64 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    /// Send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Close timeout as a [`Duration`].
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        check_path("endpointPath", &self.endpoint_path)?;
        if let Some(ingest) = &self.ingest_path {
            check_path("ingestPath", ingest)?;
            if ingest == &self.endpoint_path {
                return Err(SettingsError::InvalidValue(
                    "ingestPath must differ from endpointPath".to_string(),
                ));
            }
        }
        for (name, value) in [
            ("sendTimeoutMs", self.send_timeout_ms),
            ("closeTimeoutMs", self.close_timeout_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("heartbeatTimeoutMs", self.heartbeat_timeout_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be positive")));
            }
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "heartbeatTimeoutMs must be at least heartbeatIntervalMs".to_string(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "sendQueueCapacity must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "maxConnections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Publisher client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Ingest URL the publisher connects to.
    pub url: String,
    /// Upper bound on the connect + handshake.
    pub connect_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws/ingest".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl ClientSettings {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "client url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connectTimeoutMs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn check_path(name: &str, path: &str) -> Result<()> {
    if path.len() < 2 || !path.starts_with('/') {
        return Err(SettingsError::InvalidValue(format!(
            "{name} must be an absolute route like /ws, got {path:?}"
        )));
    }
    Ok(())
}
