//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tls_acceptor_connections_accepted_total` (counter)
//! - `tls_acceptor_accept_errors_total` (counter): by `kind` (transient, fatal)
//! - `tls_acceptor_handshakes_total` (counter): by `outcome`
//! - `tls_acceptor_active_sessions` (gauge)
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_accepted() {
    counter!("tls_acceptor_connections_accepted_total").increment(1);
}

pub fn record_accept_error(kind: &'static str) {
    counter!("tls_acceptor_accept_errors_total", "kind" => kind).increment(1);
}

/// `outcome` is `ok` or an error kind.
pub fn record_handshake(outcome: &'static str) {
    counter!("tls_acceptor_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_active_sessions(count: u64) {
    gauge!("tls_acceptor_active_sessions").set(count as f64);
}
