//! Metrics export for Courier.
//!
//! The delivery path records through the `metrics` facade (see
//! `courier_core::metrics`); this module describes those series and installs
//! the Prometheus exporter.

use courier_core::metrics::names;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Describe every metric the server emits.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_SUPERSEDED,
        "Connections closed because the same identity reconnected"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Inbound frames by event type");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Message deliveries by path (live, backlog) and outcome (sent, deferred)"
    );
    metrics::describe_counter!(
        names::ACKS_TOTAL,
        "Acknowledgments to senders by outcome (sent, pending)"
    );
    metrics::describe_histogram!(
        names::FRAME_LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
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
