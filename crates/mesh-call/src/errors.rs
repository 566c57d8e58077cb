//! Call coordinator error types.
//!
//! Only a subset of errors is meant for the application: `InvalidState`,
//! `Throttled`, `MissingMembership` and failures during `enter()`. The rest are
//! contained inside the session (logged and isolated per peer).

use crate::actors::messages::GroupCallState;
use common::types::ParticipantId;
use thiserror::Error;

/// Call coordinator error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// Operation attempted from a lifecycle state that forbids it.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: GroupCallState,
    },

    /// Announcement publish/retract or a signaling/media call failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer setup short-circuited because the peer's breaker is open.
    #[error("Circuit breaker open for {0}")]
    BreakerOpen(ParticipantId),

    /// Reaction rate limit exceeded.
    #[error("Reaction rate limit exceeded")]
    Throttled,

    /// No live membership announcement for an operation that requires one.
    #[error("No matching membership announcement")]
    MissingMembership,

    /// No session registered for the given room and call.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Conflict error (e.g., session already registered).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Registry is shutting down and not accepting new sessions.
    #[error("Registry is draining")]
    Draining,

    /// A signaling step was not valid for the peer channel's state.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Internal error (actor channel failures and similar).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Whether the error should be surfaced to the application.
    ///
    /// `BreakerOpen` is a no-op from the caller's point of view, and
    /// per-peer transport and signaling failures are contained by the session.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        match self {
            CallError::InvalidState { .. }
            | CallError::Throttled
            | CallError::MissingMembership
            | CallError::CallNotFound(_)
            | CallError::Conflict(_)
            | CallError::Draining
            | CallError::Internal(_) => true,
            CallError::Transport(_) | CallError::BreakerOpen(_) | CallError::Signaling(_) => false,
        }
    }

    /// Short, bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            CallError::InvalidState { .. } => "invalid_state",
            CallError::Transport(_) => "transport",
            CallError::BreakerOpen(_) => "breaker_open",
            CallError::Throttled => "throttled",
            CallError::MissingMembership => "missing_membership",
            CallError::CallNotFound(_) => "not_found",
            CallError::Conflict(_) => "conflict",
            CallError::Draining => "draining",
            CallError::Signaling(_) => "signaling",
            CallError::Internal(_) => "internal",
        }
    }
}
