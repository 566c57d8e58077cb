//! Media transport contract.
//!
//! The media engine owns capture devices and peer connections. This crate
//! only drives it: every method is a capability call whose failures surface as
//! [`CallError::Transport`].

use crate::announcement::{Feed, FeedPurpose};
use crate::errors::CallError;
use crate::signaling::{IceCandidate, SessionDescription};
use common::types::{CallId, ParticipantId, RoomId, SessionId};
use std::fmt;
use tokio::sync::mpsc;

/// Opaque identifier of a peer connection inside the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Parameters for a new peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub room_id: RoomId,
    pub call_id: CallId,
    pub remote: ParticipantId,
    pub remote_session: SessionId,
}

/// Transport-level connection state reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Events emitted by a connection after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A locally gathered candidate that must be trickled to the remote.
    LocalCandidate(IceCandidate),
}

/// Capture device that can be muted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Microphone,
    Camera,
}

/// Media engine capability.
#[async_trait::async_trait]
pub trait MediaTransport: Send + Sync {
    /// Open capture for a feed.
    async fn acquire_local_media(&self, purpose: FeedPurpose) -> Result<Feed, CallError>;

    /// Stop capture for a feed.
    async fn release_local_media(&self, purpose: FeedPurpose) -> Result<(), CallError>;

    async fn set_device_muted(&self, kind: DeviceKind, muted: bool) -> Result<(), CallError>;

    /// Create a peer connection. Events for it arrive on the returned receiver.
    async fn create_connection(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(ConnectionHandle, mpsc::Receiver<ConnectionEvent>), CallError>;

    async fn attach_local_media(&self, handle: ConnectionHandle, feed: &Feed)
        -> Result<(), CallError>;

    async fn detach_local_media(
        &self,
        handle: ConnectionHandle,
        purpose: FeedPurpose,
    ) -> Result<(), CallError>;

    async fn create_offer(&self, handle: ConnectionHandle) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self, handle: ConnectionHandle)
        -> Result<SessionDescription, CallError>;

    async fn set_local_description(
        &self,
        handle: ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), CallError>;

    async fn set_remote_description(
        &self,
        handle: ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), CallError>;

    async fn add_remote_candidate(
        &self,
        handle: ConnectionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), CallError>;

    /// Whether the connection can accept SDP and candidate operations.
    fn is_ready(&self, handle: ConnectionHandle) -> bool;

    async fn close_connection(&self, handle: ConnectionHandle);
}
