//! Delivery metrics.
//!
//! Recorded through the `metrics` facade; the server installs the exporter.
//! Without an installed recorder every call here is a no-op.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const CONNECTIONS_SUPERSEDED: &str = "courier_connections_superseded_total";
    pub const FRAMES_TOTAL: &str = "courier_frames_total";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const ACKS_TOTAL: &str = "courier_acks_total";
    pub const FRAME_LATENCY_SECONDS: &str = "courier_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Record an accepted connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a closed connection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection evicted by a newer one for the same identity.
pub fn record_superseded() {
    counter!(names::CONNECTIONS_SUPERSEDED).increment(1);
}

/// Record an inbound frame by event type.
pub fn record_frame(event: &str) {
    counter!(names::FRAMES_TOTAL, "event" => event.to_string()).increment(1);
}

/// Record a message delivery attempt.
///
/// `path` is `live` or `backlog`; `outcome` is `sent` or `deferred`.
pub fn record_delivery(path: &'static str, outcome: &'static str) {
    counter!(names::DELIVERIES_TOTAL, "path" => path, "outcome" => outcome).increment(1);
}

/// Record an acknowledgment emitted to a sender (`sent` or `pending`).
pub fn record_ack(outcome: &'static str) {
    counter!(names::ACKS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record how long handling one inbound frame took.
pub fn record_latency(seconds: f64) {
    histogram!(names::FRAME_LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
