//! Prometheus metrics for the SFU controller.
//!
//! Naming follows Prometheus conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `worker`: pool size (fixed at startup)
//! - `event`: client and engine event names (~20 values)
//! - `class`: 4 error classes
//! - `actor_type`: 2 values (registry, room)
//! - `operation`: bounded by Redis commands (~5 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to
/// render `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips include engine calls
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Room creation spans worker selection, router and observer creation
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_room_creation".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set room creation buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_redis".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set Redis latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Participant Metrics (Gauges)
// ============================================================================

/// Set the number of active rooms.
///
/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Adjust the number of connected participants across all rooms.
///
/// Metric: `sfu_participants_active`
pub fn participant_added() {
    gauge!("sfu_participants_active").increment(1.0);
}

pub fn participant_removed() {
    gauge!("sfu_participants_active").decrement(1.0);
}

/// Set the sampled CPU load of one worker.
///
/// Metric: `sfu_worker_load`
/// Labels: `worker` (pool index)
pub fn set_worker_load(index: usize, load: f64) {
    gauge!("sfu_worker_load", "worker" => index.to_string()).set(load);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `sfu_consumers_created_total`
pub fn record_consumer_created() {
    counter!("sfu_consumers_created_total").increment(1);
}

/// Record a handler failure caught by the isolation wrapper.
///
/// Metric: `sfu_handler_failures_total`
/// Labels: `event`, `class`
pub fn record_handler_failure(event: &str, class: &str) {
    counter!(
        "sfu_handler_failures_total",
        "event" => event.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Outbound signaling frames dropped because the connection queue was full.
///
/// Metric: `sfu_signaling_frames_dropped_total`
pub fn record_frame_dropped() {
    counter!("sfu_signaling_frames_dropped_total").increment(1);
}

/// Metric: `sfu_connections_rejected_total`
/// Labels: `reason` (capacity, unauthorized, admission)
pub fn record_connection_rejected(reason: &str) {
    counter!("sfu_connections_rejected_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Metric: `sfu_room_creation_duration_seconds`
pub fn record_room_creation(duration: Duration) {
    histogram!("sfu_room_creation_duration_seconds").record(duration.as_secs_f64());
}

/// Record handling latency of a room message.
///
/// Metric: `sfu_message_latency_seconds`
/// Labels: `event`
pub fn record_message_latency(event: &str, duration: Duration) {
    histogram!("sfu_message_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sfu_redis_latency_seconds`
/// Labels: `operation`
pub fn record_redis_latency(operation: &str, duration: Duration) {
    histogram!("sfu_redis_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}
