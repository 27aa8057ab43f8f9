//! Metrics collection and exposition.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize metrics exporter and server.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("metrics server listening on http://{}", addr);
}

/// Record a finished session.
pub fn record_session(protocol: &str, outcome: &str) {
    let labels = [
        ("protocol", protocol.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("sidestep_sessions_total", &labels).increment(1);
}

/// Record a backend pick.
pub fn record_pick(backend: &str) {
    counter!("sidestep_picks_total", "backend" => backend.to_string()).increment(1);
}

/// Record a fallback from one backend to the next.
pub fn record_fallback(backend: &str) {
    counter!("sidestep_fallbacks_total", "backend" => backend.to_string()).increment(1);
}

/// Record relayed bytes in one direction.
pub fn record_relayed(direction: &'static str, bytes: u64) {
    counter!("sidestep_relayed_bytes_total", "direction" => direction).increment(bytes);
}

/// Update the liveness gauge for a backend.
pub fn record_backend_died(backend: &str, died: bool) {
    let val = if died { 0.0 } else { 1.0 };
    gauge!("sidestep_backend_alive", "backend" => backend.to_string()).set(val);
}
