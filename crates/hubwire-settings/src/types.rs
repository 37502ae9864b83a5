//! Settings types.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Connection and dispatch behaviour.
    pub hub: HubSection,
    /// HTTP/WebSocket host.
    pub server: ServerSection,
    /// Log output.
    pub logging: LoggingSection,
}

/// Connection and dispatch behaviour.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSection {
    /// How long a client has to complete the handshake.
    pub handshake_timeout_ms: u64,
    /// Idle time after which the server sends a ping.
    pub keep_alive_interval_ms: u64,
    /// Silence from the client after which the connection is aborted.
    pub client_timeout_ms: u64,
    /// Include error detail in completion and close messages.
    pub enable_detailed_errors: bool,
    /// Protocol names accepted in the handshake. Empty accepts every
    /// registered protocol.
    pub supported_protocols: Vec<String>,
    /// Items buffered between a push-based stream producer and the writer.
    pub stream_buffer_capacity: usize,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 15_000,
            keep_alive_interval_ms: 15_000,
            client_timeout_ms: 30_000,
            enable_detailed_errors: false,
            supported_protocols: Vec::new(),
            stream_buffer_capacity: 10,
        }
    }
}

/// HTTP/WebSocket host settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSection {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks an ephemeral port).
    pub port: u16,
    /// Route serving the hub WebSocket.
    pub path: String,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            path: "/hub".to_string(),
            max_message_size: 32 * 1024,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl HubSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let hub = &self.hub;
        if hub.handshake_timeout_ms == 0 {
            return Err(invalid("hub.handshakeTimeoutMs must be greater than zero"));
        }
        if hub.keep_alive_interval_ms == 0 {
            return Err(invalid("hub.keepAliveIntervalMs must be greater than zero"));
        }
        if hub.client_timeout_ms <= hub.keep_alive_interval_ms {
            return Err(invalid(
                "hub.clientTimeoutMs must be greater than hub.keepAliveIntervalMs",
            ));
        }
        if hub.stream_buffer_capacity == 0 {
            return Err(invalid("hub.streamBufferCapacity must be greater than zero"));
        }
        if !self.server.path.starts_with('/') {
            return Err(invalid("server.path must start with '/'"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> SettingsError {
    SettingsError::InvalidValue(message.to_string())
}
