//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a private recorder. Nothing is recorded into it unless
/// it is installed elsewhere; used when the global recorder is taken.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names.

/// Subscriber connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Subscriber connections closed (counter, labels: cause).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Currently open subscriber connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Subscriber connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused before the handshake (counter, labels: reason).
pub const WS_HANDSHAKE_REJECTIONS_TOTAL: &str = "ws_handshake_rejections_total";
/// Values received on the ingest endpoint (counter).
pub const INGEST_VALUES_TOTAL: &str = "ingest_values_total";
/// Events published (counter).
pub const BROADCAST_EVENTS_TOTAL: &str = "broadcast_events_total";
/// Per-connection deliveries that succeeded (counter).
pub const BROADCAST_DELIVERED_TOTAL: &str = "broadcast_delivered_total";
/// Per-connection deliveries that failed (counter, labels: reason).
pub const BROADCAST_FAILED_TOTAL: &str = "broadcast_failed_total";
/// Time to hand one event to every snapshot member (histogram).
pub const BROADCAST_DURATION_SECONDS: &str = "broadcast_duration_seconds";
