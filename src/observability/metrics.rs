//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_total` (counter): accepted connections by mode
//! - `proxy_active_connections` (gauge): current connection count
//! - `proxy_requests_total` (counter): forwarded requests by method, status
//! - `proxy_request_duration_seconds` (histogram): forward round-trip latency
//! - `proxy_tunnel_bytes_total` (counter): tunneled bytes by direction
//! - `proxy_errors_total` (counter): per-connection failures by kind
//! - `proxy_accept_errors_total` (counter): transient accept failures

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Which handler a connection was dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Forward,
    Tunnel,
    Rejected,
}

impl ConnectionMode {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Forward => "forward",
            ConnectionMode::Tunnel => "tunnel",
            ConnectionMode::Rejected => "rejected",
        }
    }
}

pub fn record_connection(mode: ConnectionMode) {
    counter!("proxy_connections_total", "mode" => mode.as_str()).increment(1);
}

pub fn set_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_tunnel_bytes(upstream: u64, downstream: u64) {
    counter!("proxy_tunnel_bytes_total", "direction" => "upstream").increment(upstream);
    counter!("proxy_tunnel_bytes_total", "direction" => "downstream").increment(downstream);
}

pub fn record_error(kind: &'static str) {
    counter!("proxy_errors_total", "kind" => kind).increment(1);
}

pub fn record_accept_error() {
    counter!("proxy_accept_errors_total").increment(1);
}
