//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::announcement::{CallDescriptor, FeedPurpose};
use crate::errors::CallError;
use crate::media::{ConnectionHandle, DeviceKind};
use crate::mesh::{PeerRole, SignalingState};
use crate::signaling::SignalingEnvelope;
use common::types::{CallId, ParticipantId, RoomId, SessionId};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

use super::session::GroupCallHandle;

/// Messages sent to `CallRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Create a session for a call the local user is about to join.
    CreateSession {
        room_id: RoomId,
        call_id: CallId,
        respond_to: oneshot::Sender<Result<GroupCallHandle, CallError>>,
    },

    /// A call was observed in a room. Creates the session if needed and
    /// notifies event subscribers.
    IncomingCall {
        room_id: RoomId,
        call_id: CallId,
        respond_to: oneshot::Sender<Result<GroupCallHandle, CallError>>,
    },

    /// Get a handle to an existing session.
    GetSession {
        room_id: RoomId,
        call_id: CallId,
        respond_to: oneshot::Sender<Result<GroupCallHandle, CallError>>,
    },

    /// Leave and drop a session.
    RemoveSession {
        room_id: RoomId,
        call_id: CallId,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Route inbound signaling to the session it belongs to.
    Dispatch {
        envelope: SignalingEnvelope,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Get registry status.
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Leave every call and stop.
    Shutdown {
        /// Per-session leave deadline.
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
}

/// Messages sent to `GroupCallActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Acquire local media ahead of entering.
    InitializeLocalMedia {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Enter the call.
    Enter {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    /// Leave the call. Always succeeds.
    Leave { respond_to: oneshot::Sender<()> },

    SetDeviceMuted {
        kind: DeviceKind,
        muted: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    SetScreensharingEnabled {
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },

    SendReaction {
        key: String,
        ephemeral: bool,
        /// Response channel for the reaction event id.
        respond_to: oneshot::Sender<Result<String, CallError>>,
    },

    /// Inbound signaling from a remote device.
    Signaling { envelope: SignalingEnvelope },

    /// Get current session state.
    GetState {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
}

/// Timers owned by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTimer {
    /// Re-publish the local announcement. Stale generations are ignored.
    RefreshAnnouncement { generation: u64 },
    /// Confirm or suppress provisional departures. Only entries still stamped
    /// with `generation` are decided.
    SettleRecheck {
        candidates: Vec<ParticipantId>,
        generation: u64,
    },
    /// The tie-break wait for `participant` has elapsed.
    TieBreakDeadline {
        participant: ParticipantId,
        generation: u64,
    },
    /// The earliest live announcement is about to expire.
    MembershipExpiry,
    /// Restore one unit of reaction budget.
    ReactionDecay,
    /// Re-subscribe to the announcement stream.
    Resubscribe,
}

impl SessionTimer {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionTimer::RefreshAnnouncement { .. } => "refresh",
            SessionTimer::SettleRecheck { .. } => "settle",
            SessionTimer::TieBreakDeadline { .. } => "tie_break",
            SessionTimer::MembershipExpiry => "expiry",
            SessionTimer::ReactionDecay => "reaction_decay",
            SessionTimer::Resubscribe => "resubscribe",
        }
    }
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Lifecycle state of a group call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupCallState {
    Uninitialized,
    /// Local media acquired, not yet entered.
    Initialized,
    Entered,
    /// Terminal.
    Ended,
}

impl GroupCallState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            GroupCallState::Uninitialized => "uninitialized",
            GroupCallState::Initialized => "initialized",
            GroupCallState::Entered => "entered",
            GroupCallState::Ended => "ended",
        }
    }
}

impl fmt::Display for GroupCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events broadcast to session subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupCallEvent {
    StateChanged(GroupCallState),
    /// One batch of new participants, in identity order.
    ParticipantsJoined(Vec<ParticipantId>),
    /// One batch of confirmed departures, in identity order.
    ParticipantsLeft(Vec<ParticipantId>),
}

/// Events broadcast to registry subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A call the local user has not created was observed.
    IncomingCall(CallDescriptor),
}

/// Information about one peer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub remote: ParticipantId,
    pub remote_session: SessionId,
    pub connection: ConnectionHandle,
    pub role: PeerRole,
    pub state: SignalingState,
    /// Remote candidates waiting for the remote description.
    pub queued_candidates: usize,
    pub remote_audio_muted: bool,
    pub remote_video_muted: bool,
}

/// Current state of a session (for applications and tests).
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub descriptor: CallDescriptor,
    pub local: ParticipantId,
    pub session_id: SessionId,
    pub state: GroupCallState,
    /// Participant set, in identity order, local included once entered.
    pub participants: Vec<ParticipantId>,
    /// Departures waiting for the settle delay.
    pub pending_departures: Vec<ParticipantId>,
    pub peers: Vec<PeerInfo>,
    pub local_feeds: Vec<FeedPurpose>,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub reactions_outstanding: u32,
    pub mailbox_depth: usize,
}

impl SessionSnapshot {
    /// Peer info for one remote, if a channel exists.
    #[must_use]
    pub fn peer(&self, remote: &ParticipantId) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| &p.remote == remote)
    }
}

/// Status of the `CallRegistryActor`.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    /// Sessions currently held.
    pub session_count: usize,
    /// Sessions in the `Entered` state.
    pub entered_count: usize,
    /// Whether the registry is draining.
    pub is_draining: bool,
    /// Current mailbox depth.
    pub mailbox_depth: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_group_call_state_display() {
        assert_eq!(GroupCallState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(GroupCallState::Entered.to_string(), "entered");
        assert_eq!(GroupCallState::Ended.to_string(), "ended");
    }

    #[test]
    fn test_timer_labels_are_distinct() {
        let timers = [
            SessionTimer::RefreshAnnouncement { generation: 1 },
            SessionTimer::SettleRecheck {
                candidates: vec![],
                generation: 1,
            },
            SessionTimer::TieBreakDeadline {
                participant: ParticipantId::new("a", "D"),
                generation: 1,
            },
            SessionTimer::MembershipExpiry,
            SessionTimer::ReactionDecay,
            SessionTimer::Resubscribe,
        ];
        let labels: std::collections::HashSet<_> =
            timers.iter().map(SessionTimer::as_str).collect();
        assert_eq!(labels.len(), timers.len());
    }

    #[test]
    fn test_registry_status_fields() {
        let status = RegistryStatus {
            session_count: 2,
            entered_count: 1,
            is_draining: false,
            mailbox_depth: 0,
        };
        assert_eq!(status.session_count, 2);
        assert!(!status.is_draining);
    }
}
