//! Process-wide observability setup.
//!
//! Recorders and subscribers are global, so these live in their own test
//! binary instead of the library's unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use mesh_call::observability::{
    init_metrics_recorder, init_tracing, record_peer_setup, record_signaling_dropped,
    set_sessions_active,
};

#[test]
fn test_prometheus_recorder_renders_call_metrics() {
    let handle = init_metrics_recorder().unwrap();

    record_peer_setup("initiated");
    record_signaling_dropped("loopback");
    set_sessions_active(3);

    let rendered = handle.render();
    assert!(rendered.contains("call_peer_setup_total"));
    assert!(rendered.contains("outcome=\"initiated\""));
    assert!(rendered.contains("call_signaling_dropped_total"));
    assert!(rendered.contains("call_sessions_active 3"));

    // A second recorder cannot be installed.
    assert!(init_metrics_recorder().is_err());
}

#[test]
fn test_tracing_subscriber_installs_once() {
    init_tracing("mesh_call=debug").unwrap();
    assert!(init_tracing("mesh_call=info").is_err());
}
