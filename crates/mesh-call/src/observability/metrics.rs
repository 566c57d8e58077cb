//! Metrics definitions for the call coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `call_` prefix
//! - `_total` suffix for counters
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 2 values (registry, session)
//! - `outcome`: bounded by setup and reaction outcomes (~6 values)
//! - `reason`: bounded drop reasons (5 values)

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return its handle.
///
/// Embedding applications that already run their own recorder skip this.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Registry Metrics
// ============================================================================

/// Metric: `call_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("call_sessions_active").set(count as f64);
}

/// Metric: `call_actor_mailbox_depth`
/// Labels: `actor_type` (registry, session)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("call_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Metric: `call_actor_panics_total`
///
/// ALERT: any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("call_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Mesh Metrics
// ============================================================================

/// Metric: `call_peer_setup_total`
/// Labels: `outcome` (initiated, answered, awaiting, failed, breaker_open, escalated)
pub fn record_peer_setup(outcome: &str) {
    counter!("call_peer_setup_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `call_breaker_opened_total`
pub fn record_breaker_opened() {
    counter!("call_breaker_opened_total").increment(1);
}

/// Metric: `call_signaling_dropped_total`
/// Labels: `reason` (not_entered, unknown_call, loopback, stale_session, breaker_open)
pub fn record_signaling_dropped(reason: &str) {
    counter!("call_signaling_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Metric: `call_reconciliation_total`
pub fn record_reconciliation() {
    counter!("call_reconciliation_total").increment(1);
}

/// Metric: `call_participants_changed_total`
/// Labels: `direction` (joined, left)
pub fn record_participants_changed(direction: &str, count: usize) {
    counter!("call_participants_changed_total", "direction" => direction.to_string())
        .increment(count as u64);
}

/// Metric: `call_departures_suppressed_total`
///
/// Provisional departures whose announcement reappeared within the settle delay.
pub fn record_departure_suppressed() {
    counter!("call_departures_suppressed_total").increment(1);
}

/// Metric: `call_announcement_publish_total`
/// Labels: `status` (success, error)
pub fn record_announcement_publish(status: &str) {
    counter!("call_announcement_publish_total", "status" => status.to_string()).increment(1);
}

/// Metric: `call_reactions_total`
/// Labels: `outcome` (sent, throttled, error)
pub fn record_reaction(outcome: &str) {
    counter!("call_reactions_total", "outcome" => outcome.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_recorded() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        // Metrics recorders are global; this is the only test in the crate
        // that installs one.
        let _ = recorder.install();

        set_sessions_active(2);
        set_actor_mailbox_depth("session", 3);
        record_actor_panic("session");
        record_peer_setup("initiated");
        record_peer_setup("failed");
        record_breaker_opened();
        record_signaling_dropped("not_entered");
        record_reconciliation();
        record_participants_changed("joined", 2);
        record_departure_suppressed();
        record_announcement_publish("success");
        record_reaction("throttled");

        let metrics = snapshotter.snapshot().into_vec();
        assert!(
            metrics.len() >= 10,
            "expected at least 10 distinct series, got {}",
            metrics.len()
        );
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_peer_setup("escalated");
        record_reaction("sent");
        set_sessions_active(0);
    }
}
