//! `MeshCoordinator` - the peer connections of one call.
//!
//! The coordinator is owned by its session actor and driven from the actor's
//! loop; it never runs concurrently with itself. It owns:
//!
//! - one [`PeerChannel`] per remote identity (at most one)
//! - the in-flight setup guard, including identities waiting on tie-break
//! - candidates that arrived before any channel existed
//! - the local feeds attached to every new connection
//!
//! Circuit breakers live on a [`CircuitBreakerBoard`] shared across sessions.
//!
//! # Modules
//!
//! - [`breaker`] - Per-identity circuit breakers
//! - [`peer`] - Per-connection signaling state machine
//! - [`tie_break`] - Initiator selection

pub mod breaker;
pub mod peer;
pub mod tie_break;

pub use breaker::{BreakerState, CircuitBreakerBoard};
pub use peer::{PeerChannel, PeerRole, SignalingState};
pub use tie_break::TieBreak;

use crate::actors::messages::PeerInfo;
use crate::announcement::{CallDescriptor, Feed, FeedPurpose};
use crate::config::Config;
use crate::errors::CallError;
use crate::media::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionState, MediaTransport,
};
use crate::observability::metrics;
use crate::signaling::{
    EventSender, HangupReason, IceCandidate, SignalingEnvelope, SignalingPayload,
};
use common::types::{ParticipantId, SessionId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on candidates buffered for a remote with no channel yet.
const MAX_EARLY_CANDIDATES: usize = 64;

/// A connection event tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub remote: ParticipantId,
    pub connection: ConnectionHandle,
    pub event: ConnectionEvent,
}

/// What the session should do after [`MeshCoordinator::begin_setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPlan {
    /// Call [`MeshCoordinator::initiate`] now.
    InitiateNow,
    /// Schedule a deadline; call [`MeshCoordinator::on_await_deadline`] when it fires.
    AwaitRemote { timeout: Duration, generation: u64 },
    /// A connection or setup already exists.
    AlreadyActive,
    /// Tie-break could not order the pair.
    Escalated,
}

#[derive(Debug)]
struct AwaitingOffer {
    generation: u64,
    remote_session: SessionId,
}

/// Peer connections for one call.
pub struct MeshCoordinator {
    local: ParticipantId,
    local_session: SessionId,
    descriptor: CallDescriptor,
    tie_break_timeout: Duration,
    tie_break_secondary_timeout: Duration,
    media: Arc<dyn MediaTransport>,
    sender: Arc<dyn EventSender>,
    breakers: CircuitBreakerBoard,
    peers: HashMap<ParticipantId, PeerChannel>,
    in_flight: HashSet<ParticipantId>,
    awaiting: HashMap<ParticipantId, AwaitingOffer>,
    next_generation: u64,
    early_candidates: HashMap<ParticipantId, Vec<IceCandidate>>,
    local_feeds: BTreeMap<FeedPurpose, Feed>,
    audio_muted: bool,
    video_muted: bool,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    /// Parent of every connection's event-forwarding token.
    cancel_token: CancellationToken,
}

impl MeshCoordinator {
    /// Create a coordinator.
    ///
    /// Connection events are forwarded to `peer_events`; forwarding tasks
    /// stop when `cancel_token` is cancelled.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        local: ParticipantId,
        local_session: SessionId,
        descriptor: CallDescriptor,
        config: &Config,
        media: Arc<dyn MediaTransport>,
        sender: Arc<dyn EventSender>,
        breakers: CircuitBreakerBoard,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            local,
            local_session,
            descriptor,
            tie_break_timeout: config.tie_break_timeout,
            tie_break_secondary_timeout: config.tie_break_secondary_timeout,
            media,
            sender,
            breakers,
            peers: HashMap::new(),
            in_flight: HashSet::new(),
            awaiting: HashMap::new(),
            next_generation: 0,
            early_candidates: HashMap::new(),
            local_feeds: BTreeMap::new(),
            audio_muted: false,
            video_muted: false,
            peer_events,
            cancel_token,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// A channel exists or a setup (including a tie-break wait) is in flight.
    #[must_use]
    pub fn has_connection_or_setup(&self, remote: &ParticipantId) -> bool {
        self.peers.contains_key(remote) || self.in_flight.contains(remote)
    }

    #[must_use]
    pub fn is_awaiting_offer(&self, remote: &ParticipantId) -> bool {
        self.awaiting.contains_key(remote)
    }

    #[must_use]
    pub fn peer_session(&self, remote: &ParticipantId) -> Option<&SessionId> {
        self.peers.get(remote).map(PeerChannel::remote_session)
    }

    #[must_use]
    pub fn peer_state(&self, remote: &ParticipantId) -> Option<SignalingState> {
        self.peers.get(remote).map(PeerChannel::state)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Snapshot of every channel, ordered by identity.
    #[must_use]
    pub fn peer_states(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.values().map(PeerChannel::info).collect();
        infos.sort_by(|a, b| a.remote.cmp(&b.remote));
        infos
    }

    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerBoard {
        &self.breakers
    }

    // ------------------------------------------------------------------------
    // Local media
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn has_local_feed(&self, purpose: FeedPurpose) -> bool {
        self.local_feeds.contains_key(&purpose)
    }

    #[must_use]
    pub fn local_feeds(&self) -> Vec<Feed> {
        self.local_feeds.values().cloned().collect()
    }

    /// Remember a feed for connections created from now on.
    pub fn set_local_feed(&mut self, feed: Feed) {
        self.local_feeds.insert(feed.purpose, feed);
    }

    /// Forget every local feed, returning them for release.
    pub fn take_local_feeds(&mut self) -> Vec<Feed> {
        std::mem::take(&mut self.local_feeds).into_values().collect()
    }

    /// Add a feed and attach it to every existing connection.
    pub async fn attach_feed_all(&mut self, feed: Feed) {
        for channel in self.peers.values() {
            if let Err(e) = self.media.attach_local_media(channel.handle(), &feed).await {
                warn!(
                    target: "call.mesh",
                    remote = %channel.remote(),
                    purpose = feed.purpose.as_str(),
                    error = %e,
                    "Failed to attach local feed"
                );
            }
        }
        self.local_feeds.insert(feed.purpose, feed);
    }

    /// Remove a feed and detach it from every existing connection.
    pub async fn detach_feed_all(&mut self, purpose: FeedPurpose) -> Option<Feed> {
        let feed = self.local_feeds.remove(&purpose)?;
        for channel in self.peers.values() {
            if let Err(e) = self.media.detach_local_media(channel.handle(), purpose).await {
                warn!(
                    target: "call.mesh",
                    remote = %channel.remote(),
                    purpose = purpose.as_str(),
                    error = %e,
                    "Failed to detach local feed"
                );
            }
        }
        Some(feed)
    }

    /// Record local mute state and tell every connected peer.
    pub async fn broadcast_metadata(&mut self, audio_muted: bool, video_muted: bool) {
        self.audio_muted = audio_muted;
        self.video_muted = video_muted;

        let targets: Vec<ParticipantId> = self
            .peers
            .values()
            .filter(|c| c.state() == SignalingState::Connected)
            .map(|c| c.remote().clone())
            .collect();

        for remote in targets {
            let payload = SignalingPayload::MetadataChanged {
                audio_muted,
                video_muted,
            };
            if let Err(e) = self.send(&remote, payload).await {
                warn!(
                    target: "call.mesh",
                    remote = %remote,
                    error = %e,
                    "Failed to send metadata update"
                );
            }
        }
    }

    #[must_use]
    pub fn local_mute_state(&self) -> (bool, bool) {
        (self.audio_muted, self.video_muted)
    }

    /// Send a fresh offer on every connected channel.
    pub async fn renegotiate_all(&mut self) {
        let targets: Vec<ParticipantId> = self
            .peers
            .values()
            .filter(|c| c.state() == SignalingState::Connected)
            .map(|c| c.remote().clone())
            .collect();

        for remote in targets {
            let offer = match self.peers.get_mut(&remote) {
                Some(channel) => channel.create_offer(&*self.media).await,
                None => continue,
            };
            match offer {
                Ok(Some(payload)) => {
                    if let Err(e) = self.send(&remote, payload).await {
                        warn!(
                            target: "call.mesh",
                            remote = %remote,
                            error = %e,
                            "Failed to send renegotiation offer"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        target: "call.mesh",
                        remote = %remote,
                        error = %e,
                        "Renegotiation failed"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    /// Decide how to set up a connection to `remote`.
    ///
    /// Marks the identity in flight for every plan that leads to a setup.
    pub fn begin_setup(
        &mut self,
        remote: &ParticipantId,
        remote_session: &SessionId,
    ) -> Result<SetupPlan, CallError> {
        if self.has_connection_or_setup(remote) {
            return Ok(SetupPlan::AlreadyActive);
        }

        if let Err(e) = self.breakers.check(remote) {
            debug!(
                target: "call.mesh",
                remote = %remote,
                "Breaker open, skipping setup"
            );
            metrics::record_peer_setup("breaker_open");
            return Err(e);
        }

        match tie_break::resolve(
            &self.local,
            &self.local_session,
            remote,
            remote_session,
            self.tie_break_timeout,
            self.tie_break_secondary_timeout,
        ) {
            TieBreak::Initiate => {
                self.in_flight.insert(remote.clone());
                Ok(SetupPlan::InitiateNow)
            }
            TieBreak::AwaitRemote { timeout } => {
                self.next_generation += 1;
                let generation = self.next_generation;
                self.in_flight.insert(remote.clone());
                self.awaiting.insert(
                    remote.clone(),
                    AwaitingOffer {
                        generation,
                        remote_session: remote_session.clone(),
                    },
                );
                debug!(
                    target: "call.mesh",
                    remote = %remote,
                    timeout_ms = timeout.as_millis() as u64,
                    "Awaiting remote offer"
                );
                metrics::record_peer_setup("awaiting");
                Ok(SetupPlan::AwaitRemote {
                    timeout,
                    generation,
                })
            }
            TieBreak::Escalate => {
                error!(
                    target: "call.mesh",
                    remote = %remote,
                    session = %remote_session,
                    "Tie-break cannot order identical identity and session, not connecting"
                );
                metrics::record_peer_setup("escalated");
                Ok(SetupPlan::Escalated)
            }
        }
    }

    /// Create a connection to `remote` and send our offer.
    ///
    /// The in-flight guard is released whatever the outcome.
    pub async fn initiate(
        &mut self,
        remote: &ParticipantId,
        remote_session: &SessionId,
    ) -> Result<(), CallError> {
        let result = self.initiate_inner(remote, remote_session).await;
        self.in_flight.remove(remote);

        match &result {
            Ok(()) => {
                info!(
                    target: "call.mesh",
                    remote = %remote,
                    "Offer sent"
                );
                metrics::record_peer_setup("initiated");
            }
            Err(e) => self.on_setup_failed(remote, e),
        }
        result
    }

    async fn initiate_inner(
        &mut self,
        remote: &ParticipantId,
        remote_session: &SessionId,
    ) -> Result<(), CallError> {
        let mut channel = self
            .open_channel(remote, remote_session, PeerRole::Initiator)
            .await?;

        let payload = match channel.create_offer(&*self.media).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                channel.hangup(&*self.media).await;
                return Err(CallError::Signaling("offer rejected locally".to_string()));
            }
            Err(e) => {
                channel.hangup(&*self.media).await;
                return Err(e);
            }
        };

        if let Err(e) = self.send(remote, payload).await {
            channel.hangup(&*self.media).await;
            return Err(e);
        }

        if let Some(early) = self.early_candidates.remove(remote) {
            channel.add_remote_candidates(&*self.media, early).await;
        }
        self.peers.insert(remote.clone(), channel);
        Ok(())
    }

    /// Handle the expiry of a tie-break wait.
    ///
    /// Stale generations are ignored. If the remote's offer has arrived in
    /// the meantime there is nothing to do; otherwise we initiate.
    pub async fn on_await_deadline(
        &mut self,
        remote: &ParticipantId,
        generation: u64,
    ) -> Result<(), CallError> {
        if self.awaiting.get(remote).map(|w| w.generation) != Some(generation) {
            return Ok(());
        }
        let Some(waiting) = self.awaiting.remove(remote) else {
            return Ok(());
        };

        if self.peers.contains_key(remote) {
            self.in_flight.remove(remote);
            return Ok(());
        }

        info!(
            target: "call.mesh",
            remote = %remote,
            "Remote did not offer in time, initiating"
        );
        self.initiate(remote, &waiting.remote_session).await
    }

    fn on_setup_failed(&mut self, remote: &ParticipantId, error: &CallError) {
        warn!(
            target: "call.mesh",
            remote = %remote,
            error = %error,
            "Peer setup failed"
        );
        metrics::record_peer_setup("failed");
        // Local rejections say nothing about the remote device.
        if !matches!(error, CallError::Signaling(_)) {
            self.record_failure(remote);
        }
    }

    fn record_failure(&self, remote: &ParticipantId) {
        if self.breakers.record_failure(remote) {
            metrics::record_breaker_opened();
        }
    }

    async fn open_channel(
        &self,
        remote: &ParticipantId,
        remote_session: &SessionId,
        role: PeerRole,
    ) -> Result<PeerChannel, CallError> {
        let config = ConnectionConfig {
            room_id: self.descriptor.room_id.clone(),
            call_id: self.descriptor.call_id.clone(),
            remote: remote.clone(),
            remote_session: remote_session.clone(),
        };
        let (handle, events) = self.media.create_connection(&config).await?;
        let events_token = self.spawn_event_forwarder(remote.clone(), handle, events);

        let mut channel = PeerChannel::new(
            remote.clone(),
            remote_session.clone(),
            handle,
            role,
            events_token,
        );

        for feed in self.local_feeds.values() {
            if let Err(e) = self.media.attach_local_media(handle, feed).await {
                channel.hangup(&*self.media).await;
                return Err(e);
            }
        }

        debug!(
            target: "call.mesh",
            remote = %remote,
            connection = %handle,
            role = ?role,
            "Connection created"
        );
        Ok(channel)
    }

    fn spawn_event_forwarder(
        &self,
        remote: ParticipantId,
        connection: ConnectionHandle,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) -> CancellationToken {
        let token = self.cancel_token.child_token();
        let task_token = token.clone();
        let tx = self.peer_events.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let forwarded = PeerEvent {
                            remote: remote.clone(),
                            connection,
                            event,
                        };
                        if tx.send(forwarded).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        token
    }

    // ------------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------------

    /// Handle an inbound offer: new connection, renegotiation, session
    /// replacement or glare.
    pub async fn handle_offer(
        &mut self,
        sender: &ParticipantId,
        sender_session: &SessionId,
        sdp: &str,
    ) -> Result<(), CallError> {
        if let Err(e) = self.breakers.check(sender) {
            debug!(
                target: "call.mesh",
                remote = %sender,
                "Breaker open, ignoring offer"
            );
            metrics::record_signaling_dropped("breaker_open");
            return Err(e);
        }

        if let Some(existing) = self.peers.get(sender) {
            if existing.remote_session() != sender_session {
                info!(
                    target: "call.mesh",
                    remote = %sender,
                    old_session = %existing.remote_session(),
                    new_session = %sender_session,
                    "Remote session changed, replacing connection"
                );
                self.remove_peer(sender, None).await;
            } else if existing.has_outstanding_offer() {
                let local_wins = tie_break::resolve(
                    &self.local,
                    &self.local_session,
                    sender,
                    sender_session,
                    self.tie_break_timeout,
                    self.tie_break_secondary_timeout,
                ) == TieBreak::Initiate;

                if local_wins {
                    debug!(
                        target: "call.mesh",
                        remote = %sender,
                        "Glare: keeping our offer, ignoring remote offer"
                    );
                    return Ok(());
                }
                info!(
                    target: "call.mesh",
                    remote = %sender,
                    "Glare: yielding to remote offer"
                );
                self.remove_peer(sender, None).await;
            } else {
                return self.renegotiate_from_remote(sender, sdp).await;
            }
        }

        // The remote won the tie-break (or its offer raced ours): drop any wait.
        self.awaiting.remove(sender);
        self.in_flight.insert(sender.clone());
        let result = self.answer_new(sender, sender_session, sdp).await;
        self.in_flight.remove(sender);

        match &result {
            Ok(()) => {
                info!(
                    target: "call.mesh",
                    remote = %sender,
                    "Answer sent"
                );
                metrics::record_peer_setup("answered");
            }
            Err(e) => self.on_setup_failed(sender, e),
        }
        result
    }

    async fn renegotiate_from_remote(
        &mut self,
        sender: &ParticipantId,
        sdp: &str,
    ) -> Result<(), CallError> {
        let answer = match self.peers.get_mut(sender) {
            Some(channel) => channel.accept_offer(&*self.media, sdp).await,
            None => return Ok(()),
        };

        match answer {
            Ok(Some(payload)) => self.send(sender, payload).await,
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(
                    target: "call.mesh",
                    remote = %sender,
                    error = %e,
                    "Failed to apply renegotiation offer"
                );
                self.record_failure(sender);
                self.remove_peer(sender, Some(HangupReason::IceFailed)).await;
                Err(e)
            }
        }
    }

    async fn answer_new(
        &mut self,
        sender: &ParticipantId,
        sender_session: &SessionId,
        sdp: &str,
    ) -> Result<(), CallError> {
        let mut channel = self
            .open_channel(sender, sender_session, PeerRole::Responder)
            .await?;

        if let Some(early) = self.early_candidates.remove(sender) {
            channel.add_remote_candidates(&*self.media, early).await;
        }

        let payload = match channel.accept_offer(&*self.media, sdp).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                channel.hangup(&*self.media).await;
                return Err(CallError::Signaling("offer rejected locally".to_string()));
            }
            Err(e) => {
                channel.hangup(&*self.media).await;
                return Err(e);
            }
        };

        if let Err(e) = self.send(sender, payload).await {
            channel.hangup(&*self.media).await;
            return Err(e);
        }

        self.peers.insert(sender.clone(), channel);
        Ok(())
    }

    /// Apply the remote's answer to our offer.
    pub async fn handle_answer(
        &mut self,
        sender: &ParticipantId,
        sender_session: &SessionId,
        sdp: &str,
    ) -> Result<(), CallError> {
        let outcome = match self.peers.get_mut(sender) {
            Some(channel) if channel.remote_session() == sender_session => {
                channel.accept_answer(&*self.media, sdp).await
            }
            Some(_) => {
                debug!(
                    target: "call.mesh",
                    remote = %sender,
                    "Answer from stale session, ignoring"
                );
                metrics::record_signaling_dropped("stale_session");
                return Ok(());
            }
            None => {
                debug!(
                    target: "call.mesh",
                    remote = %sender,
                    "Answer without a connection, ignoring"
                );
                return Ok(());
            }
        };

        if let Err(e) = outcome {
            self.record_failure(sender);
            self.remove_peer(sender, Some(HangupReason::IceFailed)).await;
            return Err(e);
        }
        Ok(())
    }

    /// Apply or buffer remote candidates.
    pub async fn handle_candidates(
        &mut self,
        sender: &ParticipantId,
        sender_session: &SessionId,
        candidates: Vec<IceCandidate>,
    ) {
        match self.peers.get_mut(sender) {
            Some(channel) if channel.remote_session() == sender_session => {
                channel.add_remote_candidates(&*self.media, candidates).await;
            }
            Some(_) => {
                metrics::record_signaling_dropped("stale_session");
            }
            None => {
                let buffer = self.early_candidates.entry(sender.clone()).or_default();
                buffer.extend(candidates);
                let excess = buffer.len().saturating_sub(MAX_EARLY_CANDIDATES);
                if excess > 0 {
                    buffer.drain(..excess);
                }
                debug!(
                    target: "call.mesh",
                    remote = %sender,
                    buffered = buffer.len(),
                    "Buffered candidates for unknown peer"
                );
            }
        }
    }

    /// Remote hung up. Returns whether a channel was removed.
    pub async fn handle_remote_hangup(
        &mut self,
        sender: &ParticipantId,
        sender_session: &SessionId,
    ) -> bool {
        if self.peer_session(sender) != Some(sender_session) {
            return false;
        }
        info!(
            target: "call.mesh",
            remote = %sender,
            "Remote hung up"
        );
        self.remove_peer(sender, None).await;
        true
    }

    pub fn handle_remote_metadata(
        &mut self,
        sender: &ParticipantId,
        audio_muted: bool,
        video_muted: bool,
    ) {
        if let Some(channel) = self.peers.get_mut(sender) {
            channel.set_remote_metadata(audio_muted, video_muted);
        }
    }

    /// Handle a connection event.
    ///
    /// Returns the identity whose connection failed and was torn down, so the
    /// session can set it up again if it is still a participant.
    pub async fn on_connection_event(&mut self, event: PeerEvent) -> Option<ParticipantId> {
        let PeerEvent {
            remote,
            connection,
            event,
        } = event;

        let channel = self.peers.get_mut(&remote)?;
        if channel.handle() != connection {
            debug!(
                target: "call.mesh",
                remote = %remote,
                connection = %connection,
                "Event from replaced connection, ignoring"
            );
            return None;
        }

        match event {
            ConnectionEvent::StateChanged(state) => {
                channel.on_connection_state(state);
                if !matches!(state, ConnectionState::Failed | ConnectionState::Closed) {
                    channel.flush_candidates(&*self.media).await;
                }
                match state {
                    ConnectionState::Connected => {
                        info!(
                            target: "call.mesh",
                            remote = %remote,
                            "Peer connected"
                        );
                        self.breakers.record_success(&remote);
                        None
                    }
                    ConnectionState::Failed => {
                        warn!(
                            target: "call.mesh",
                            remote = %remote,
                            "Peer connection failed"
                        );
                        self.record_failure(&remote);
                        self.remove_peer(&remote, Some(HangupReason::IceFailed))
                            .await;
                        Some(remote)
                    }
                    ConnectionState::Closed => {
                        info!(
                            target: "call.mesh",
                            remote = %remote,
                            "Peer connection closed"
                        );
                        self.remove_peer(&remote, None).await;
                        None
                    }
                    ConnectionState::New | ConnectionState::Connecting => None,
                }
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                let payload = SignalingPayload::Candidates {
                    candidates: vec![candidate],
                };
                if let Err(e) = self.send(&remote, payload).await {
                    debug!(
                        target: "call.mesh",
                        remote = %remote,
                        error = %e,
                        "Failed to send local candidate"
                    );
                }
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Hang up on `remote` (best effort), close the connection and drop all
    /// setup state. Breaker counters are kept.
    pub async fn teardown(&mut self, remote: &ParticipantId) {
        self.remove_peer(remote, Some(HangupReason::UserHangup))
            .await;
    }

    /// Close the connection to a superseded session without signaling it.
    ///
    /// A hangup would reach the remote identity's new session.
    pub async fn discard(&mut self, remote: &ParticipantId) {
        self.remove_peer(remote, None).await;
    }

    pub async fn teardown_all(&mut self) {
        let remotes: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        for remote in remotes {
            self.teardown(&remote).await;
        }
        self.in_flight.clear();
        self.awaiting.clear();
        self.early_candidates.clear();
    }

    async fn remove_peer(&mut self, remote: &ParticipantId, hangup: Option<HangupReason>) {
        self.awaiting.remove(remote);
        self.in_flight.remove(remote);
        self.early_candidates.remove(remote);

        let Some(mut channel) = self.peers.remove(remote) else {
            return;
        };

        if let Some(reason) = hangup {
            if channel.state() != SignalingState::Ended {
                if let Err(e) = self.send(remote, SignalingPayload::Hangup { reason }).await {
                    debug!(
                        target: "call.mesh",
                        remote = %remote,
                        error = %e,
                        "Best-effort hangup failed"
                    );
                }
            }
        }

        channel.hangup(&*self.media).await;
        debug!(
            target: "call.mesh",
            remote = %remote,
            remaining = self.peers.len(),
            "Peer removed"
        );
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn send(
        &self,
        remote: &ParticipantId,
        payload: SignalingPayload,
    ) -> Result<(), CallError> {
        let envelope = SignalingEnvelope {
            room_id: self.descriptor.room_id.clone(),
            call_id: self.descriptor.call_id.clone(),
            sender: self.local.clone(),
            sender_session_id: self.local_session.clone(),
            payload,
        };
        self.sender.send_to_device(remote, &envelope).await
    }
}
