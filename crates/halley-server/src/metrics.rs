//! Metrics collection and export for Halley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use halley_core::{
    Channel, ChannelLifecycleListener, Server, ServerListener, Session, SessionId,
    SessionLifecycleListener, SubscriptionListener,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "halley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "halley_connections_active";
    pub const SESSIONS_TOTAL: &str = "halley_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "halley_sessions_active";
    pub const MESSAGES_TOTAL: &str = "halley_messages_total";
    pub const MESSAGES_BYTES: &str = "halley_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "halley_channels_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "halley_subscriptions_total";
    pub const LATENCY_SECONDS: &str = "halley_latency_seconds";
    pub const ERRORS_TOTAL: &str = "halley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_counter!(names::SESSIONS_TOTAL, "Total number of connected sessions");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of connected sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of message batches processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of message batches processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of channels");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscriptions"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Request processing latency in seconds"
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

/// Record a new WebSocket connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a closed WebSocket connection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message batch.
pub fn record_message(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record request latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Engine listener feeding session, channel and subscription metrics.
pub struct EngineMetrics;

impl EngineMetrics {
    /// Register on `server` for every event kind it reports.
    pub fn install(server: &Server) {
        let metrics = Arc::new(EngineMetrics);
        server.add_listener(ServerListener::Session(metrics.clone()));
        server.add_listener(ServerListener::Channel(metrics.clone()));
        server.add_listener(ServerListener::Subscription(metrics));
    }
}

impl SessionLifecycleListener for EngineMetrics {
    fn on_connected(&self, _session: &Session) {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
    }

    fn on_disconnected(&self, session: &Session) {
        // Sessions that never connected were never counted.
        if session.transport().is_some() {
            gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
        }
    }
}

impl ChannelLifecycleListener for EngineMetrics {
    fn on_created(&self, _channel: &Channel) {
        gauge!(names::CHANNELS_ACTIVE).increment(1.0);
    }

    fn on_removed(&self, _channel: &Channel) {
        gauge!(names::CHANNELS_ACTIVE).decrement(1.0);
    }
}

impl SubscriptionListener for EngineMetrics {
    fn on_subscribed(&self, _channel: &Channel, _session_id: &SessionId) {
        counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
    }

    fn on_unsubscribed(&self, _channel: &Channel, _session_id: &SessionId) {}
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
    use halley_core::EngineConfig;

    #[test]
    fn test_metrics_guard() {
        let _guard = ConnectionMetricsGuard::new();
    }

    #[test]
    fn test_engine_metrics_listen_without_recorder() {
        let server = Server::new(EngineConfig::default()).unwrap();
        EngineMetrics::install(&server);
        let session = server.create_local_session();
        server.subscribe_session(&session, "/chat/room").unwrap();
        server.purge_session(&session);
    }
}
