//! Observability for the call coordinator.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with explicit fields. Metric
//! labels are bounded; participant identities never appear as labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `call_sessions_active` | Gauge | none | Sessions held by the registry |
//! | `call_peer_setup_total` | Counter | `outcome` | Peer setup attempts and their result |
//! | `call_breaker_opened_total` | Counter | none | Breakers opened (incl. failed probes) |
//! | `call_reconciliation_total` | Counter | none | Reconciliation passes |
//! | `call_participants_changed_total` | Counter | `direction` | Joined/left participants |
//! | `call_departures_suppressed_total` | Counter | none | Provisional departures that reappeared |
//! | `call_announcement_publish_total` | Counter | `status` | Announcement publications |
//! | `call_reactions_total` | Counter | `outcome` | Reactions sent or throttled |
//! | `call_signaling_dropped_total` | Counter | `reason` | Inbound signaling discarded |
//! | `call_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |

pub mod metrics;

pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_announcement_publish, record_breaker_opened,
    record_departure_suppressed, record_participants_changed, record_peer_setup,
    record_reaction, record_reconciliation, record_signaling_dropped, set_actor_mailbox_depth,
    set_sessions_active,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `tracing` subscriber with an `EnvFilter`.
///
/// `RUST_LOG` takes precedence over `default_filter`. Fails if a global
/// subscriber is already set.
pub fn init_tracing(default_filter: &str) -> Result<(), String> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| format!("Failed to install tracing subscriber: {e}"))
}
