//! Mock outbound event transport.
//!
//! Records every to-device envelope and reaction so tests can assert on what
//! a session sent, and can make sends to one device fail.

use common::types::{ParticipantId, RoomId};
use mesh_call::errors::CallError;
use mesh_call::signaling::{EventSender, Reaction, SignalingEnvelope, SignalingPayload};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Mock event sender.
#[derive(Debug, Clone)]
pub struct MockEventSender {
    inner: Arc<Mutex<MockSenderInner>>,
}

#[derive(Debug, Default)]
struct MockSenderInner {
    sent: Vec<(ParticipantId, SignalingEnvelope)>,
    reactions: Vec<(RoomId, Reaction)>,
    fail_to: HashSet<ParticipantId>,
    fail_reactions: bool,
    next_id: u64,
}

impl Default for MockEventSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEventSender {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockSenderInner::default())),
        }
    }

    /// Every envelope sent, with its target, oldest first.
    pub fn sent(&self) -> Vec<(ParticipantId, SignalingEnvelope)> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Payloads sent to one device, oldest first.
    pub fn sent_to(&self, target: &ParticipantId) -> Vec<SignalingPayload> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(to, _)| to == target)
            .map(|(_, envelope)| envelope.payload.clone())
            .collect()
    }

    /// Number of payloads of `kind` (see `SignalingPayload::kind`) sent to one device.
    pub fn count_to(&self, target: &ParticipantId, kind: &str) -> usize {
        self.sent_to(target)
            .iter()
            .filter(|payload| payload.kind() == kind)
            .count()
    }

    /// The most recent envelope sent to one device.
    pub fn last_to(&self, target: &ParticipantId) -> Option<SignalingEnvelope> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .rev()
            .find(|(to, _)| to == target)
            .map(|(_, envelope)| envelope.clone())
    }

    pub fn reactions(&self) -> Vec<(RoomId, Reaction)> {
        self.inner.lock().unwrap().reactions.clone()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sent.clear();
        inner.reactions.clear();
    }

    /// Make every send to `target` fail.
    pub fn fail_sends_to(&self, target: &ParticipantId) {
        self.inner.lock().unwrap().fail_to.insert(target.clone());
    }

    pub fn set_fail_reactions(&self, fail: bool) {
        self.inner.lock().unwrap().fail_reactions = fail;
    }
}

#[async_trait::async_trait]
impl EventSender for MockEventSender {
    async fn send_to_device(
        &self,
        target: &ParticipantId,
        envelope: &SignalingEnvelope,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_to.contains(target) {
            return Err(CallError::Transport(format!("cannot deliver to {target}")));
        }
        inner.sent.push((target.clone(), envelope.clone()));
        Ok(())
    }

    async fn send_reaction(
        &self,
        room_id: &RoomId,
        reaction: &Reaction,
    ) -> Result<String, CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_reactions {
            return Err(CallError::Transport("reaction rejected".to_string()));
        }
        inner.next_id += 1;
        inner.reactions.push((room_id.clone(), reaction.clone()));
        Ok(format!("$reaction-{}", inner.next_id))
    }
}
