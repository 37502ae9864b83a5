//! Runtime options derived from [`HubSettings`].

use std::time::Duration;

use hubwire_settings::HubSettings;

/// Duration-typed view of the hub settings used by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubOptions {
    /// Time allowed for the client to send its handshake request.
    pub handshake_timeout: Duration,
    /// Idle time after which a ping is written.
    pub keep_alive_interval: Duration,
    /// Inbound silence after which the connection is aborted.
    pub client_timeout: Duration,
    /// Send error detail to clients.
    pub enable_detailed_errors: bool,
    /// Accepted protocol names; empty accepts every registered protocol.
    pub supported_protocols: Vec<String>,
    /// Buffer between push-based stream producers and the writer.
    pub stream_buffer_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from(&HubSettings::default())
    }
}

impl From<&HubSettings> for HubOptions {
    fn from(settings: &HubSettings) -> Self {
        let hub = &settings.hub;
        Self {
            handshake_timeout: Duration::from_millis(hub.handshake_timeout_ms),
            keep_alive_interval: Duration::from_millis(hub.keep_alive_interval_ms),
            client_timeout: Duration::from_millis(hub.client_timeout_ms),
            enable_detailed_errors: hub.enable_detailed_errors,
            supported_protocols: hub.supported_protocols.clone(),
            stream_buffer_capacity: hub.stream_buffer_capacity.max(1),
        }
    }
}

impl HubOptions {
    /// Whether `protocol` may be negotiated.
    pub fn allows_protocol(&self, protocol: &str) -> bool {
        self.supported_protocols.is_empty()
            || self
                .supported_protocols
                .iter()
                .any(|p| p.eq_ignore_ascii_case(protocol))
    }
}
