//! Metrics collection and exposition.
//!
//! # Metrics
//! - `wtvp_connections_active` (gauge): live client connections
//! - `wtvp_frames_total` (counter): decoded frames by kind
//!   (plaintext, encrypted, pseudo, relogin, rejected)
//! - `wtvp_responses_total` (counter): responses by status code
//! - `wtvp_frame_bytes` (histogram): inbound frame sizes
//! - `wtvp_dispatch_duration_seconds` (histogram): time spent producing a response
//! - `wtvp_identities` (gauge): known client identities
//!
//! # Design Decisions
//! - Macros from the `metrics` facade; without an installed recorder they are no-ops
//! - Prometheus exposition only when enabled in config

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one response written to a client.
pub fn record_response(status: Option<u16>, started: Instant) {
    let status = status.map(|code| code.to_string()).unwrap_or_else(|| "none".to_string());
    metrics::counter!("wtvp_responses_total", "status" => status).increment(1);
    metrics::histogram!("wtvp_dispatch_duration_seconds").record(started.elapsed().as_secs_f64());
}

/// Record one frame outcome.
pub fn record_frame(kind: &'static str) {
    metrics::counter!("wtvp_frames_total", "kind" => kind).increment(1);
}
