//! Metrics collection and export for Herald.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use herald_core::sink::{CLOSE_IDLE, CLOSE_REJECTED, CLOSE_REPLACED, CLOSE_WRITE_FAILED};
use herald_core::RegistryStats;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const USERS_ONLINE: &str = "herald_users_online";
    pub const DEVICES_ONLINE: &str = "herald_devices_online";
    pub const HANDSHAKE_REJECTIONS: &str = "herald_handshake_rejections_total";
    pub const EVENTS_TOTAL: &str = "herald_events_total";
    pub const EVENTS_BYTES: &str = "herald_events_bytes";
    pub const CLOSES_TOTAL: &str = "herald_closes_total";
    pub const LATENCY_SECONDS: &str = "herald_latency_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of accepted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of accepted connections"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one connection");
    metrics::describe_gauge!(names::DEVICES_ONLINE, "Devices with a connection");
    metrics::describe_counter!(
        names::HANDSHAKE_REJECTIONS,
        "Handshakes rejected for missing identity"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events processed");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total bytes of events processed");
    metrics::describe_counter!(
        names::CLOSES_TOTAL,
        "Server-initiated closes by reason"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a rejected handshake.
pub fn record_handshake_rejection() {
    counter!(names::HANDSHAKE_REJECTIONS).increment(1);
}

/// Record an event.
pub fn record_event(bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a server-initiated close.
pub fn record_close(code: u16) {
    counter!(names::CLOSES_TOTAL, "reason" => close_reason(code)).increment(1);
}

/// Record event processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update presence gauges.
pub fn set_presence(stats: RegistryStats) {
    gauge!(names::USERS_ONLINE).set(stats.users as f64);
    gauge!(names::DEVICES_ONLINE).set(stats.devices as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metric label for a close code.
#[must_use]
pub fn close_reason(code: u16) -> &'static str {
    match code {
        CLOSE_REPLACED => "replaced",
        CLOSE_IDLE => "idle",
        CLOSE_REJECTED => "rejected",
        CLOSE_WRITE_FAILED => "write_failed",
        _ => "other",
    }
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; must not panic.
        let _guard = ConnectionMetricsGuard::new();
    }

    #[test]
    fn test_close_reason_labels() {
        assert_eq!(close_reason(CLOSE_REPLACED), "replaced");
        assert_eq!(close_reason(CLOSE_IDLE), "idle");
        assert_eq!(close_reason(CLOSE_WRITE_FAILED), "write_failed");
        assert_eq!(close_reason(1011), "other");
    }
}
