//! Membership announcements and the announcement store contract.
//!
//! Each device in a call publishes one announcement into the room's replicated
//! state. Announcements carry an absolute expiry; an expired announcement is
//! treated exactly like an absent one. The store pushes change-sets to
//! subscribers, and every session keeps an [`AnnouncementView`] built from
//! them.

use crate::config::Config;
use crate::errors::CallError;
use common::types::{CallId, ParticipantId, RoomId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

/// What a media feed carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedPurpose {
    /// Camera and microphone.
    Usermedia,
    /// Screen capture.
    Screenshare,
}

impl FeedPurpose {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            FeedPurpose::Usermedia => "usermedia",
            FeedPurpose::Screenshare => "screenshare",
        }
    }
}

/// A local media stream advertised in an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub stream_id: String,
    pub purpose: FeedPurpose,
}

/// Identifies one group call: every announcement for it must match all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub room_id: RoomId,
    pub call_id: CallId,
    pub application: String,
    pub scope: String,
}

impl CallDescriptor {
    /// Build a descriptor using the configured application and scope.
    #[must_use]
    pub fn new(room_id: RoomId, call_id: CallId, config: &Config) -> Self {
        Self {
            room_id,
            call_id,
            application: config.application.clone(),
            scope: config.scope.clone(),
        }
    }

    /// Whether an announcement belongs to this call (expiry not considered).
    #[must_use]
    pub fn matches(&self, announcement: &Announcement) -> bool {
        announcement.room_id == self.room_id
            && announcement.call_id == self.call_id
            && announcement.application == self.application
            && announcement.scope == self.scope
    }
}

/// One device's declaration that it is in a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub participant: ParticipantId,
    pub call_id: CallId,
    pub application: String,
    pub scope: String,
    pub room_id: RoomId,
    pub session_id: SessionId,
    /// Absolute expiry, milliseconds since the Unix epoch.
    pub expires_at_ms: i64,
    #[serde(default)]
    pub feeds: Vec<Feed>,
}

impl Announcement {
    /// An announcement at or past its expiry is absent.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }

    fn key(&self) -> AnnouncementKey {
        AnnouncementKey {
            participant: self.participant.clone(),
            call_id: self.call_id.clone(),
            application: self.application.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// Request to write (or overwrite) the local device's announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub descriptor: CallDescriptor,
    pub participant: ParticipantId,
    pub session_id: SessionId,
    pub expires_at_ms: i64,
    pub feeds: Vec<Feed>,
}

impl PublishRequest {
    /// The announcement this request produces once replicated.
    #[must_use]
    pub fn to_announcement(&self) -> Announcement {
        Announcement {
            participant: self.participant.clone(),
            call_id: self.descriptor.call_id.clone(),
            application: self.descriptor.application.clone(),
            scope: self.descriptor.scope.clone(),
            room_id: self.descriptor.room_id.clone(),
            session_id: self.session_id.clone(),
            expires_at_ms: self.expires_at_ms,
            feeds: self.feeds.clone(),
        }
    }
}

/// A single state change observed on the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementChange {
    Published(Announcement),
    Retracted {
        participant: ParticipantId,
        call_id: CallId,
        application: String,
        scope: String,
    },
}

/// Changes delivered together by the store for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementChangeSet {
    pub room_id: RoomId,
    pub changes: Vec<AnnouncementChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AnnouncementKey {
    participant: ParticipantId,
    call_id: CallId,
    application: String,
    scope: String,
}

/// Latest-wins view of one room's announcements.
#[derive(Debug, Default)]
pub struct AnnouncementView {
    entries: HashMap<AnnouncementKey, Announcement>,
}

impl AnnouncementView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a change-set. Duplicated publications simply overwrite.
    pub fn apply(&mut self, change_set: AnnouncementChangeSet) {
        for change in change_set.changes {
            match change {
                AnnouncementChange::Published(announcement) => {
                    self.entries.insert(announcement.key(), announcement);
                }
                AnnouncementChange::Retracted {
                    participant,
                    call_id,
                    application,
                    scope,
                } => {
                    self.entries.remove(&AnnouncementKey {
                        participant,
                        call_id,
                        application,
                        scope,
                    });
                }
            }
        }
    }

    /// Live members of a call and the session each one announced.
    #[must_use]
    pub fn members_of(
        &self,
        descriptor: &CallDescriptor,
        now_ms: i64,
    ) -> BTreeMap<ParticipantId, SessionId> {
        self.entries
            .values()
            .filter(|a| descriptor.matches(a) && !a.is_expired(now_ms))
            .map(|a| (a.participant.clone(), a.session_id.clone()))
            .collect()
    }

    /// Earliest future expiry among a call's live announcements.
    #[must_use]
    pub fn next_expiry(&self, descriptor: &CallDescriptor, now_ms: i64) -> Option<i64> {
        self.entries
            .values()
            .filter(|a| descriptor.matches(a) && !a.is_expired(now_ms))
            .map(|a| a.expires_at_ms)
            .min()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Replicated store of membership announcements.
#[async_trait::async_trait]
pub trait AnnouncementStore: Send + Sync {
    /// Publish the local announcement. Returns the store's id for it.
    async fn publish(&self, request: &PublishRequest) -> Result<String, CallError>;

    /// Remove the local announcement for a call.
    async fn retract(
        &self,
        participant: &ParticipantId,
        descriptor: &CallDescriptor,
    ) -> Result<(), CallError>;

    /// Subscribe to a room's announcement changes.
    ///
    /// The first change-set carries the current view. Dropping the receiver
    /// unsubscribes.
    async fn subscribe(
        &self,
        room_id: &RoomId,
    ) -> Result<mpsc::Receiver<AnnouncementChangeSet>, CallError>;
}
