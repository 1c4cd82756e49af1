//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_exchanges_total` (counter): relayed responses by method, status
//! - `proxy_upstream_errors_total` (counter): transport failures by method
//! - `proxy_upstream_duration_seconds` (histogram): time to origin response head
//! - `proxy_decoded_responses_total` (counter): gzip bodies decoded for inspection
//! - `proxy_tunnels_total` (counter): CONNECT tunnels opened
//! - `proxy_interception_errors_total` (counter): tunnels closed by interceptor errors
//! - `proxy_active_connections` (gauge): client connections plus open tunnels

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Install the Prometheus recorder and its scrape endpoint on `address`.
///
/// Must be called from within the tokio runtime.
pub fn init_metrics(address: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()?;
    describe_metrics();
    tracing::info!(address = %address, "Metrics endpoint listening");
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "proxy_exchanges_total",
        "Responses relayed to clients, by request method and status"
    );
    describe_counter!(
        "proxy_upstream_errors_total",
        "Outbound requests that failed before a response arrived"
    );
    describe_histogram!(
        "proxy_upstream_duration_seconds",
        Unit::Seconds,
        "Time from sending the outbound request to the response head"
    );
    describe_counter!(
        "proxy_decoded_responses_total",
        "gzip responses decoded before relay"
    );
    describe_counter!("proxy_tunnels_total", "CONNECT tunnels opened");
    describe_counter!(
        "proxy_interception_errors_total",
        "Tunnels closed because interception failed"
    );
    describe_counter!(
        "proxy_audit_dropped_total",
        "Audit records dropped because the writer fell behind"
    );
    describe_gauge!(
        "proxy_active_connections",
        "Open client connections and tunnels"
    );
}
