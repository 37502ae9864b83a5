//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants.

/// Active hub connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "hub_connections_active";
/// Connections that completed the handshake (counter).
pub const CONNECTIONS_TOTAL: &str = "hub_connections_total";
/// Failed handshakes (counter, labels: reason).
pub const HANDSHAKE_FAILURES_TOTAL: &str = "hub_handshake_failures_total";
/// Invocations started (counter, labels: method).
pub const INVOCATIONS_TOTAL: &str = "hub_invocations_total";
/// Invocations that ended in an error completion (counter, labels: method, kind).
pub const INVOCATION_ERRORS_TOTAL: &str = "hub_invocation_errors_total";
/// Invocation wall time (histogram, labels: method).
pub const INVOCATION_DURATION_SECONDS: &str = "hub_invocation_duration_seconds";
/// Stream items written (counter).
pub const STREAM_ITEMS_TOTAL: &str = "hub_stream_items_total";
/// Messages written to transports (counter).
pub const MESSAGES_SENT_TOTAL: &str = "hub_messages_sent_total";
/// Protocol encodes performed by the serialization cache (counter, labels: protocol).
pub const SERIALIZATIONS_TOTAL: &str = "hub_serializations_total";
/// Fan-out sends (counter, labels: kind).
pub const BROADCASTS_TOTAL: &str = "hub_broadcasts_total";
