//! Metrics definitions for the hub.
//!
//! All metrics follow Prometheus naming conventions:
//! - `hub_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (hub, recorder, connection)
//! - `message_type`: bounded by the signaling message table (~10 values)
//! - `operation`: bounded by the pending operation kinds (6 values)
//! - `outcome`: bounded by recording outcomes (4 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used by `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round-trips include media engine calls
        .set_buckets_for_metric(
            Matcher::Prefix("hub_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Recording sessions run for minutes to hours
        .set_buckets_for_metric(
            Matcher::Prefix("hub_recording_duration".to_string()),
            &[1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 14400.0],
        )
        .map_err(|e| format!("Failed to set recording duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Gauges
// ============================================================================

/// Metric: `hub_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_connections_active").set(count as f64);
}

/// Metrics: `hub_streamers_active`, `hub_viewers_active`
pub fn set_role_counts(streamers: usize, viewers: usize) {
    #[allow(clippy::cast_precision_loss)]
    {
        gauge!("hub_streamers_active").set(streamers as f64);
        gauge!("hub_viewers_active").set(viewers as f64);
    }
}

/// Metric: `hub_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record time from request receipt to reply.
///
/// Metric: `hub_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("hub_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `hub_messages_dropped_total`
/// Labels: `actor_type`
///
/// Non-zero values mean a client is not draining its socket.
pub fn record_message_dropped(actor_type: &str) {
    counter!("hub_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Metric: `hub_operation_timeouts_total`
/// Labels: `operation`
pub fn record_operation_timeout(operation: &str) {
    counter!("hub_operation_timeouts_total", "operation" => operation.to_string()).increment(1);
}

/// Metric: `hub_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("hub_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Recording
// ============================================================================

/// Metric: `hub_recordings_active`
pub fn set_recordings_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("hub_recordings_active").set(count as f64);
}

/// Record the end of a recording session.
///
/// Metrics: `hub_recording_stops_total` (labels: `outcome`),
/// `hub_recording_duration_seconds`
pub fn record_recording_stop(outcome: &str, duration: Duration) {
    counter!("hub_recording_stops_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("hub_recording_duration_seconds").record(duration.as_secs_f64());
}
