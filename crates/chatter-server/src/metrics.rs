//! Metrics collection and export for Chatter.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use chatter_core::RouteOutcome;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chatter_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chatter_connections_active";
    pub const AUTH_FAILURES_TOTAL: &str = "chatter_auth_failures_total";
    pub const EVENTS_TOTAL: &str = "chatter_events_total";
    pub const DELIVERIES_TOTAL: &str = "chatter_deliveries_total";
    pub const DELIVERY_MISSES_TOTAL: &str = "chatter_delivery_misses_total";
    pub const ONLINE_USERS: &str = "chatter_online_users";
    pub const ROOMS_ACTIVE: &str = "chatter_rooms_active";
    pub const LATENCY_SECONDS: &str = "chatter_latency_seconds";
    pub const ERRORS_TOTAL: &str = "chatter_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Rejected handshakes by cause"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events processed by name and direction");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Events queued for recipient connections"
    );
    metrics::describe_counter!(
        names::DELIVERY_MISSES_TOTAL,
        "Routed events with no live recipient"
    );
    metrics::describe_gauge!(names::ONLINE_USERS, "Users with at least one connection");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one member");
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

/// Record a rejected handshake.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Record an event by wire name.
pub fn record_event(event: &'static str, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
}

/// Record what routing did with an event.
pub fn record_outcome(outcome: RouteOutcome) {
    match outcome {
        RouteOutcome::Delivered(n) => counter!(names::DELIVERIES_TOTAL).increment(n as u64),
        RouteOutcome::DeliveryMiss => counter!(names::DELIVERY_MISSES_TOTAL).increment(1),
        RouteOutcome::Replied => {}
    }
}

/// Record event processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update presence gauges.
pub fn set_presence(online_users: usize, rooms: usize) {
    gauge!(names::ONLINE_USERS).set(online_users as f64);
    gauge!(names::ROOMS_ACTIVE).set(rooms as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
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
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_outcome(RouteOutcome::Delivered(3));
        record_outcome(RouteOutcome::DeliveryMiss);
        record_event("message:send", "inbound");
        set_presence(2, 1);
    }
}
