//! In-memory announcement store.
//!
//! Behaves like a single replica of the room state channel:
//! - `publish`/`retract` update the store and are echoed to every subscriber
//! - `subscribe` delivers the current view as the first change-set
//! - other devices are simulated with [`MockAnnouncementStore::announce`] and
//!   [`MockAnnouncementStore::withdraw`]
//!
//! # Example
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! let store = MockAnnouncementStore::new()
//!     .with_announcement(TestAnnouncement::new(bob()).session("s-bob").build());
//!
//! store.set_fail_publish(true);
//! ```

use common::types::{CallId, ParticipantId, RoomId};
use mesh_call::announcement::{
    Announcement, AnnouncementChange, AnnouncementChangeSet, AnnouncementStore, CallDescriptor,
    PublishRequest,
};
use mesh_call::errors::CallError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Capacity of each subscription channel.
const SUBSCRIPTION_BUFFER: usize = 256;

type EntryKey = (ParticipantId, CallId, String, String);

/// Mock announcement store for session tests.
#[derive(Debug, Clone)]
pub struct MockAnnouncementStore {
    inner: Arc<Mutex<MockStoreInner>>,
}

#[derive(Debug, Default)]
struct MockStoreInner {
    rooms: HashMap<RoomId, BTreeMap<EntryKey, Announcement>>,
    subscribers: Vec<(RoomId, mpsc::Sender<AnnouncementChangeSet>)>,
    published: Vec<PublishRequest>,
    retract_count: usize,
    subscribe_count: usize,
    fail_publish: bool,
    fail_retract: bool,
    fail_subscribe: bool,
    next_id: u64,
}

impl MockStoreInner {
    fn broadcast(&mut self, room_id: &RoomId, changes: Vec<AnnouncementChange>) {
        let change_set = AnnouncementChangeSet {
            room_id: room_id.clone(),
            changes,
        };
        self.subscribers.retain(|(room, tx)| {
            if room != room_id {
                return !tx.is_closed();
            }
            tx.try_send(change_set.clone()).is_ok()
        });
    }

    fn insert(&mut self, announcement: Announcement) {
        let key = (
            announcement.participant.clone(),
            announcement.call_id.clone(),
            announcement.application.clone(),
            announcement.scope.clone(),
        );
        self.rooms
            .entry(announcement.room_id.clone())
            .or_default()
            .insert(key, announcement);
    }

    fn remove(&mut self, participant: &ParticipantId, descriptor: &CallDescriptor) -> bool {
        let key = (
            participant.clone(),
            descriptor.call_id.clone(),
            descriptor.application.clone(),
            descriptor.scope.clone(),
        );
        self.rooms
            .get_mut(&descriptor.room_id)
            .is_some_and(|entries| entries.remove(&key).is_some())
    }
}

impl Default for MockAnnouncementStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAnnouncementStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockStoreInner::default())),
        }
    }

    /// Seed an announcement that exists before anyone subscribes.
    #[must_use]
    pub fn with_announcement(self, announcement: Announcement) -> Self {
        self.inner.lock().unwrap().insert(announcement);
        self
    }

    /// Another device publishes (or refreshes) its announcement.
    pub fn announce(&self, announcement: Announcement) {
        let mut inner = self.inner.lock().unwrap();
        let room_id = announcement.room_id.clone();
        inner.insert(announcement.clone());
        inner.broadcast(&room_id, vec![AnnouncementChange::Published(announcement)]);
    }

    /// Deliver several changes as one change-set, applying them to the store.
    pub fn announce_batch(&self, room_id: &RoomId, changes: Vec<AnnouncementChange>) {
        let mut inner = self.inner.lock().unwrap();
        for change in &changes {
            match change {
                AnnouncementChange::Published(announcement) => inner.insert(announcement.clone()),
                AnnouncementChange::Retracted {
                    participant,
                    call_id,
                    application,
                    scope,
                } => {
                    let descriptor = CallDescriptor {
                        room_id: room_id.clone(),
                        call_id: call_id.clone(),
                        application: application.clone(),
                        scope: scope.clone(),
                    };
                    inner.remove(participant, &descriptor);
                }
            }
        }
        inner.broadcast(room_id, changes);
    }

    /// Another device retracts its announcement.
    pub fn withdraw(&self, participant: &ParticipantId, descriptor: &CallDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(participant, descriptor);
        inner.broadcast(
            &descriptor.room_id,
            vec![AnnouncementChange::Retracted {
                participant: participant.clone(),
                call_id: descriptor.call_id.clone(),
                application: descriptor.application.clone(),
                scope: descriptor.scope.clone(),
            }],
        );
    }

    /// End every open subscription, as if the store connection dropped.
    pub fn close_subscriptions(&self) {
        self.inner.lock().unwrap().subscribers.clear();
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.lock().unwrap().fail_publish = fail;
    }

    pub fn set_fail_retract(&self, fail: bool) {
        self.inner.lock().unwrap().fail_retract = fail;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.lock().unwrap().fail_subscribe = fail;
    }

    /// Successful publications, oldest first.
    pub fn published(&self) -> Vec<PublishRequest> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.inner.lock().unwrap().published.len()
    }

    pub fn retract_count(&self) -> usize {
        self.inner.lock().unwrap().retract_count
    }

    pub fn subscribe_count(&self) -> usize {
        self.inner.lock().unwrap().subscribe_count
    }

    pub fn open_subscriptions(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    /// Whether `participant` currently has an announcement for `descriptor`.
    pub fn is_announced(&self, participant: &ParticipantId, descriptor: &CallDescriptor) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.rooms.get(&descriptor.room_id).is_some_and(|entries| {
            entries
                .values()
                .any(|a| &a.participant == participant && descriptor.matches(a))
        })
    }
}

#[async_trait::async_trait]
impl AnnouncementStore for MockAnnouncementStore {
    async fn publish(&self, request: &PublishRequest) -> Result<String, CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_publish {
            return Err(CallError::Transport("publish failed".to_string()));
        }

        let announcement = request.to_announcement();
        inner.insert(announcement.clone());
        inner.published.push(request.clone());
        inner.next_id += 1;
        let id = format!("$announcement-{}", inner.next_id);

        let room_id = request.descriptor.room_id.clone();
        inner.broadcast(&room_id, vec![AnnouncementChange::Published(announcement)]);
        Ok(id)
    }

    async fn retract(
        &self,
        participant: &ParticipantId,
        descriptor: &CallDescriptor,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_retract {
            return Err(CallError::Transport("retract failed".to_string()));
        }

        inner.retract_count += 1;
        if inner.remove(participant, descriptor) {
            inner.broadcast(
                &descriptor.room_id,
                vec![AnnouncementChange::Retracted {
                    participant: participant.clone(),
                    call_id: descriptor.call_id.clone(),
                    application: descriptor.application.clone(),
                    scope: descriptor.scope.clone(),
                }],
            );
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: &RoomId,
    ) -> Result<mpsc::Receiver<AnnouncementChangeSet>, CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_subscribe {
            return Err(CallError::Transport("subscribe failed".to_string()));
        }
        inner.subscribe_count += 1;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let snapshot = AnnouncementChangeSet {
            room_id: room_id.clone(),
            changes: inner
                .rooms
                .get(room_id)
                .map(|entries| {
                    entries
                        .values()
                        .cloned()
                        .map(AnnouncementChange::Published)
                        .collect()
                })
                .unwrap_or_default(),
        };
        let _ = tx.try_send(snapshot);
        inner.subscribers.push((room_id.clone(), tx));
        Ok(rx)
    }
}
