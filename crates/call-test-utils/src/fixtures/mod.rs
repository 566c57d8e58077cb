//! Pre-configured test data for call coordinator tests.
//!
//! Provides:
//! - Device identities ordered `alice < bob < carol < dave`
//! - A default room, call and descriptor
//! - Announcement and envelope builders

use common::types::{CallId, ParticipantId, RoomId, SessionId};
use mesh_call::announcement::{Announcement, CallDescriptor, Feed, FeedPurpose};
use mesh_call::config::Config;
use mesh_call::signaling::{SignalingEnvelope, SignalingPayload};
use std::time::Duration;

pub const TEST_ROOM: &str = "!room:example.org";
pub const TEST_CALL: &str = "call-1";

#[must_use]
pub fn alice() -> ParticipantId {
    ParticipantId::new("@alice:example.org", "ALICE")
}

#[must_use]
pub fn bob() -> ParticipantId {
    ParticipantId::new("@bob:example.org", "BOB")
}

#[must_use]
pub fn carol() -> ParticipantId {
    ParticipantId::new("@carol:example.org", "CAROL")
}

/// Orders after the default trio.
#[must_use]
pub fn dave() -> ParticipantId {
    ParticipantId::new("@dave:example.org", "DAVE")
}

#[must_use]
pub fn room() -> RoomId {
    RoomId::from(TEST_ROOM)
}

#[must_use]
pub fn call() -> CallId {
    CallId::from(TEST_CALL)
}

#[must_use]
pub fn descriptor() -> CallDescriptor {
    CallDescriptor::new(room(), call(), &Config::default())
}

/// Announcement builder for the default call.
#[derive(Debug, Clone)]
pub struct TestAnnouncement {
    participant: ParticipantId,
    descriptor: CallDescriptor,
    session_id: SessionId,
    expires_at_ms: i64,
    feeds: Vec<Feed>,
}

impl TestAnnouncement {
    /// A live announcement expiring in one hour with a usermedia feed.
    #[must_use]
    pub fn new(participant: ParticipantId) -> Self {
        let session_id = SessionId::from(format!("session-{}", participant.device_id).as_str());
        Self {
            participant,
            descriptor: descriptor(),
            session_id,
            expires_at_ms: now_ms() + 3_600_000,
            feeds: vec![Feed {
                stream_id: "remote-usermedia".to_string(),
                purpose: FeedPurpose::Usermedia,
            }],
        }
    }

    #[must_use]
    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = SessionId::from(session_id);
        self
    }

    #[must_use]
    pub fn call(mut self, call_id: &str) -> Self {
        self.descriptor.call_id = CallId::from(call_id);
        self
    }

    #[must_use]
    pub fn application(mut self, application: &str) -> Self {
        self.descriptor.application = application.to_string();
        self
    }

    #[must_use]
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at_ms = now_ms() + i64::try_from(ttl.as_millis()).unwrap();
        self
    }

    /// Already past its expiry.
    #[must_use]
    pub fn expired(mut self) -> Self {
        self.expires_at_ms = now_ms() - 1_000;
        self
    }

    #[must_use]
    pub fn build(self) -> Announcement {
        Announcement {
            participant: self.participant,
            call_id: self.descriptor.call_id,
            application: self.descriptor.application,
            scope: self.descriptor.scope,
            room_id: self.descriptor.room_id,
            session_id: self.session_id,
            expires_at_ms: self.expires_at_ms,
            feeds: self.feeds,
        }
    }
}

/// Default session id used by [`TestAnnouncement::new`] for `participant`.
#[must_use]
pub fn session_of(participant: &ParticipantId) -> SessionId {
    SessionId::from(format!("session-{}", participant.device_id).as_str())
}

/// Signaling from `sender` (default session) for the default call.
#[must_use]
pub fn envelope(sender: &ParticipantId, payload: SignalingPayload) -> SignalingEnvelope {
    SignalingEnvelope {
        room_id: room(),
        call_id: call(),
        sender: sender.clone(),
        sender_session_id: session_of(sender),
        payload,
    }
}

#[must_use]
pub fn offer(sdp: &str) -> SignalingPayload {
    SignalingPayload::Offer {
        sdp: sdp.to_string(),
    }
}

#[must_use]
pub fn answer(sdp: &str) -> SignalingPayload {
    SignalingPayload::Answer {
        sdp: sdp.to_string(),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
