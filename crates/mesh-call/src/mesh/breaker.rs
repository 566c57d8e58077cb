//! Per-identity circuit breakers.
//!
//! The board is shared by every session of one registry: a success for an
//! identity in any call resets it, and repeated failures in any call open it.

use crate::errors::CallError;
use common::types::ParticipantId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Observable breaker state for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Attempts allowed.
    Closed,
    /// Attempts short-circuit until the cool-down elapses.
    Open,
    /// Cool-down elapsed; a single probe attempt is allowed.
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerEntry {
    failures: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

/// Shared map of identity to breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerBoard {
    inner: Arc<Mutex<HashMap<ParticipantId, BreakerEntry>>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakerBoard {
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<ParticipantId, BreakerEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A cool-down that would end past the clock's range never ends.
    fn cooling_down(&self, since: Instant, now: Instant) -> bool {
        since
            .checked_add(self.cooldown)
            .map_or(true, |until| now < until)
    }

    /// Gate an attempt for `remote`.
    ///
    /// Once the cool-down has elapsed exactly one caller is let through as a
    /// probe. If that probe never reports back, another one is allowed after a
    /// further cool-down.
    pub fn check(&self, remote: &ParticipantId) -> Result<(), CallError> {
        let now = Instant::now();
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(remote) else {
            return Ok(());
        };
        let Some(opened_at) = entry.opened_at else {
            return Ok(());
        };

        if self.cooling_down(opened_at, now) {
            return Err(CallError::BreakerOpen(remote.clone()));
        }

        match entry.probe_started {
            Some(started) if self.cooling_down(started, now) => {
                Err(CallError::BreakerOpen(remote.clone()))
            }
            _ => {
                entry.probe_started = Some(now);
                debug!(
                    target: "call.mesh",
                    remote = %remote,
                    "Breaker cool-down elapsed, allowing probe attempt"
                );
                Ok(())
            }
        }
    }

    /// Count a failure. Returns `true` if this failure opened the breaker.
    pub fn record_failure(&self, remote: &ParticipantId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries();
        let entry = entries.entry(remote.clone()).or_default();

        if entry.opened_at.is_some() {
            // Failed probe: start a new cool-down.
            entry.opened_at = Some(now);
            entry.probe_started = None;
            warn!(
                target: "call.mesh",
                remote = %remote,
                "Probe attempt failed, breaker reopened"
            );
            return true;
        }

        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.threshold {
            entry.opened_at = Some(now);
            warn!(
                target: "call.mesh",
                remote = %remote,
                failures = entry.failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker opened"
            );
            return true;
        }

        debug!(
            target: "call.mesh",
            remote = %remote,
            failures = entry.failures,
            threshold = self.threshold,
            "Peer failure recorded"
        );
        false
    }

    /// Reset the breaker after a successful connection.
    pub fn record_success(&self, remote: &ParticipantId) {
        if self.entries().remove(remote).is_some() {
            debug!(
                target: "call.mesh",
                remote = %remote,
                "Breaker reset after success"
            );
        }
    }

    #[must_use]
    pub fn state(&self, remote: &ParticipantId) -> BreakerState {
        let now = Instant::now();
        match self.entries().get(remote).and_then(|e| e.opened_at) {
            None => BreakerState::Closed,
            Some(opened_at) if self.cooling_down(opened_at, now) => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures counted since the last reset.
    #[must_use]
    pub fn failures(&self, remote: &ParticipantId) -> u32 {
        self.entries().get(remote).map_or(0, |e| e.failures)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn peer() -> ParticipantId {
        ParticipantId::new("@flaky:hs", "PHONE")
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let board = CircuitBreakerBoard::new(5, Duration::from_secs(120));

        for _ in 0..4 {
            assert!(!board.record_failure(&peer()));
            assert!(board.check(&peer()).is_ok());
        }
        assert!(board.record_failure(&peer()));

        assert_eq!(board.state(&peer()), BreakerState::Open);
        assert_eq!(
            board.check(&peer()),
            Err(CallError::BreakerOpen(peer()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_cooldown_stays_open() {
        let board = CircuitBreakerBoard::new(1, Duration::MAX);
        assert!(board.record_failure(&peer()));

        tokio::time::advance(Duration::from_secs(86_400)).await;

        assert_eq!(board.state(&peer()), BreakerState::Open);
        assert_eq!(
            board.check(&peer()),
            Err(CallError::BreakerOpen(peer()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_allows_single_probe() {
        let board = CircuitBreakerBoard::new(2, Duration::from_secs(120));
        board.record_failure(&peer());
        board.record_failure(&peer());

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(board.check(&peer()).is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(board.state(&peer()), BreakerState::HalfOpen);
        assert!(board.check(&peer()).is_ok());
        assert!(board.check(&peer()).is_err(), "only one probe per cool-down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let board = CircuitBreakerBoard::new(1, Duration::from_secs(10));
        assert!(board.record_failure(&peer()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(board.check(&peer()).is_ok());
        assert!(board.record_failure(&peer()));

        assert_eq!(board.state(&peer()), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(board.check(&peer()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_across_clones() {
        let board = CircuitBreakerBoard::new(2, Duration::from_secs(120));
        let other_session_view = board.clone();

        board.record_failure(&peer());
        board.record_failure(&peer());
        assert_eq!(other_session_view.state(&peer()), BreakerState::Open);

        other_session_view.record_success(&peer());
        assert_eq!(board.state(&peer()), BreakerState::Closed);
        assert_eq!(board.failures(&peer()), 0);
        assert!(board.check(&peer()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_probe_is_replaced() {
        let board = CircuitBreakerBoard::new(1, Duration::from_secs(10));
        board.record_failure(&peer());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(board.check(&peer()).is_ok());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(board.check(&peer()).is_ok());
    }
}
