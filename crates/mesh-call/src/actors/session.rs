//! `GroupCallActor` - one actor per `(room, call)`.
//!
//! Each `GroupCallActor`:
//! - Owns the lifecycle state, participant set, timers and reaction budget
//! - Owns exactly one `MeshCoordinator`
//! - Reconciles announcement change-sets into join/leave batches
//! - Re-announces the local membership while entered
//!
//! # Event Ordering
//!
//! Inputs are processed one at a time from a single biased `select!`:
//! cancellation, then timers, then announcement change-sets, then connection
//! events, then the mailbox. Capability calls are awaited inside a step;
//! other inputs queue meanwhile.
//!
//! # Departures
//!
//! A participant missing from a change-set is only provisionally gone. The
//! departure is re-checked after the settle delay and dropped if the
//! announcement reappeared. Confirmed departures are torn down and reported
//! in one `ParticipantsLeft` batch. When only the local device remains after
//! such a batch, the session leaves on its own.
//!
//! # Leaving
//!
//! `GroupCallHandle::leave` cancels the leave token before queueing the leave
//! step, so an in-progress setup batch stops at the next peer and setups that
//! complete afterwards are discarded.

use crate::announcement::{
    AnnouncementChangeSet, AnnouncementStore, AnnouncementView, CallDescriptor, FeedPurpose,
    PublishRequest,
};
use crate::config::{Config, MAX_DURATION_SECONDS};
use crate::errors::CallError;
use crate::media::{DeviceKind, MediaTransport};
use crate::membership;
use crate::mesh::{CircuitBreakerBoard, MeshCoordinator, PeerEvent, SetupPlan};
use crate::observability::metrics;
use crate::reactions::ReactionBudget;
use crate::signaling::{EventSender, Reaction, SignalingEnvelope, SignalingPayload};

use super::messages::{
    GroupCallEvent, GroupCallState, SessionMessage, SessionSnapshot, SessionTimer,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{ParticipantId, SessionId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 256;

/// Capacity of the session event broadcast.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Slack added to expiry timers so the wall clock has passed the expiry when they fire.
const EXPIRY_SLACK: Duration = Duration::from_millis(10);

/// Longest delay any session timer is armed with.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(MAX_DURATION_SECONDS);

/// External collaborators injected into every session.
#[derive(Clone)]
pub struct CallCapabilities {
    pub store: Arc<dyn AnnouncementStore>,
    pub media: Arc<dyn MediaTransport>,
    pub sender: Arc<dyn EventSender>,
}

impl fmt::Debug for CallCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCapabilities").finish_non_exhaustive()
    }
}

/// Handle to a `GroupCallActor`.
#[derive(Debug, Clone)]
pub struct GroupCallHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    leave_token: CancellationToken,
    descriptor: CallDescriptor,
    local: ParticipantId,
    session_id: SessionId,
    state_rx: watch::Receiver<GroupCallState>,
    events_tx: broadcast::Sender<GroupCallEvent>,
}

impl GroupCallHandle {
    #[must_use]
    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Current lifecycle state, without a round trip to the actor.
    #[must_use]
    pub fn state(&self) -> GroupCallState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state and membership events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GroupCallEvent> {
        self.events_tx.subscribe()
    }

    /// Wait until the session reaches `Ended`.
    pub async fn wait_until_ended(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|state| *state == GroupCallState::Ended)
            .await;
    }

    /// Acquire local media before entering.
    pub async fn initialize_local_media(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::InitializeLocalMedia { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Enter the call.
    pub async fn enter(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::Enter { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the call. Idempotent; a stopped actor counts as already left.
    pub async fn leave(&self) {
        self.leave_token.cancel();

        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionMessage::Leave { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    pub async fn set_device_muted(&self, kind: DeviceKind, muted: bool) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::SetDeviceMuted {
                kind,
                muted,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn set_screensharing_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::SetScreensharingEnabled {
                enabled,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Send a reaction. Returns the reaction's event id.
    pub async fn send_reaction(
        &self,
        key: impl Into<String>,
        ephemeral: bool,
    ) -> Result<String, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::SendReaction {
                key: key.into(),
                ephemeral,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Queue inbound signaling for this session.
    pub async fn deliver_signaling(&self, envelope: SignalingEnvelope) -> Result<(), CallError> {
        self.sender
            .send(SessionMessage::Signaling { envelope })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn get_state(&self) -> Result<SessionSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor. It leaves the call before stopping.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `GroupCallActor` implementation.
pub struct GroupCallActor {
    descriptor: CallDescriptor,
    local: ParticipantId,
    session_id: SessionId,
    config: Arc<Config>,
    receiver: mpsc::Receiver<SessionMessage>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    /// Cancelled as soon as a leave is requested.
    leave_token: CancellationToken,
    store: Arc<dyn AnnouncementStore>,
    media: Arc<dyn MediaTransport>,
    sender: Arc<dyn EventSender>,
    state: GroupCallState,
    state_tx: watch::Sender<GroupCallState>,
    events_tx: broadcast::Sender<GroupCallEvent>,
    view: AnnouncementView,
    /// Replace the view with the next change-set (first set after re-subscribing).
    resync_pending: bool,
    participants: BTreeSet<ParticipantId>,
    /// Provisional departures, keyed to the settle recheck that owns them.
    pending_departures: BTreeMap<ParticipantId, u64>,
    settle_generation: u64,
    changes: Option<mpsc::Receiver<AnnouncementChangeSet>>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    mesh: MeshCoordinator,
    timers: DelayQueue<SessionTimer>,
    refresh_generation: u64,
    expiry_key: Option<delay_queue::Key>,
    decay_key: Option<delay_queue::Key>,
    /// Expiry of our last successful publication.
    membership_expires_at_ms: Option<i64>,
    reactions: ReactionBudget,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl GroupCallActor {
    /// Spawn a new session actor.
    ///
    /// Returns a handle and the task join handle.
    ///
    /// # Arguments
    ///
    /// * `descriptor` - The call this session belongs to
    /// * `local` - Local device identity
    /// * `config` - Timings and thresholds
    /// * `capabilities` - Store, media engine and sender
    /// * `breakers` - Breaker board shared with the other sessions of the registry
    /// * `cancel_token` - Cancellation token (child of the registry's token)
    /// * `metrics` - Shared actor metrics
    pub fn spawn(
        descriptor: CallDescriptor,
        local: ParticipantId,
        config: Arc<Config>,
        capabilities: CallCapabilities,
        breakers: CircuitBreakerBoard,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (GroupCallHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (state_tx, state_rx) = watch::channel(GroupCallState::Uninitialized);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (peer_events_tx, peer_events) = mpsc::unbounded_channel();
        let leave_token = CancellationToken::new();
        let session_id = SessionId::new();

        let mesh = MeshCoordinator::new(
            local.clone(),
            session_id.clone(),
            descriptor.clone(),
            &config,
            Arc::clone(&capabilities.media),
            Arc::clone(&capabilities.sender),
            breakers,
            peer_events_tx,
            cancel_token.child_token(),
        );

        let actor_id = format!("{}/{}", descriptor.room_id, descriptor.call_id);
        let actor = Self {
            descriptor: descriptor.clone(),
            local: local.clone(),
            session_id: session_id.clone(),
            reactions: ReactionBudget::new(config.reaction_budget),
            config,
            receiver,
            cancel_token: cancel_token.clone(),
            leave_token: leave_token.clone(),
            store: capabilities.store,
            media: capabilities.media,
            sender: capabilities.sender,
            state: GroupCallState::Uninitialized,
            state_tx,
            events_tx: events_tx.clone(),
            view: AnnouncementView::new(),
            resync_pending: false,
            participants: BTreeSet::new(),
            pending_departures: BTreeMap::new(),
            settle_generation: 0,
            changes: None,
            peer_events,
            mesh,
            timers: DelayQueue::new(),
            refresh_generation: 0,
            expiry_key: None,
            decay_key: None,
            membership_expires_at_ms: None,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Session, actor_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = GroupCallHandle {
            sender,
            cancel_token,
            leave_token,
            descriptor,
            local,
            session_id,
            state_rx,
            events_tx,
        };

        (handle, task_handle)
    }

    /// Run the actor loop until the session has ended.
    #[instrument(
        skip_all,
        name = "call.actor.session",
        fields(room_id = %self.descriptor.room_id, call_id = %self.descriptor.call_id)
    )]
    async fn run(mut self) {
        info!(
            target: "call.actor.session",
            room_id = %self.descriptor.room_id,
            call_id = %self.descriptor.call_id,
            local = %self.local,
            session_id = %self.session_id,
            "GroupCallActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "call.actor.session",
                        call_id = %self.descriptor.call_id,
                        "GroupCallActor received cancellation signal"
                    );
                    self.leave().await;
                    break;
                }

                Some(expired) = std::future::poll_fn(|cx| self.timers.poll_expired(cx)),
                    if !self.timers.is_empty() =>
                {
                    self.handle_timer(expired.into_inner()).await;
                }

                change_set = next_change_set(&mut self.changes), if self.changes.is_some() => {
                    match change_set {
                        Some(change_set) => self.handle_change_set(change_set).await,
                        None => self.on_change_stream_ended(),
                    }
                }

                Some(event) = self.peer_events.recv() => {
                    self.handle_peer_event(event).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "call.actor.session",
                                call_id = %self.descriptor.call_id,
                                "GroupCallActor channel closed, leaving"
                            );
                            self.leave().await;
                            break;
                        }
                    }
                }
            }

            if self.state == GroupCallState::Ended {
                break;
            }
        }

        info!(
            target: "call.actor.session",
            call_id = %self.descriptor.call_id,
            messages_processed = self.mailbox.messages_processed(),
            "GroupCallActor stopped"
        );
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::InitializeLocalMedia { respond_to } => {
                let result = self.initialize_local_media().await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Enter { respond_to } => {
                let result = self.enter().await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Leave { respond_to } => {
                self.leave().await;
                let _ = respond_to.send(());
            }

            SessionMessage::SetDeviceMuted {
                kind,
                muted,
                respond_to,
            } => {
                let result = self.set_device_muted(kind, muted).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::SetScreensharingEnabled {
                enabled,
                respond_to,
            } => {
                let result = self.set_screensharing_enabled(enabled).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::SendReaction {
                key,
                ephemeral,
                respond_to,
            } => {
                let result = self.send_reaction(key, ephemeral).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Signaling { envelope } => {
                self.handle_signaling(envelope).await;
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn set_state(&mut self, next: GroupCallState) {
        if self.state == next {
            return;
        }
        info!(
            target: "call.actor.session",
            call_id = %self.descriptor.call_id,
            from = %self.state,
            to = %next,
            "Session state changed"
        );
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.events_tx.send(GroupCallEvent::StateChanged(next));
    }

    async fn initialize_local_media(&mut self) -> Result<(), CallError> {
        if self.state != GroupCallState::Uninitialized {
            return Err(CallError::InvalidState {
                operation: "initialize local media",
                state: self.state,
            });
        }

        let feed = self.media.acquire_local_media(FeedPurpose::Usermedia).await?;
        self.mesh.set_local_feed(feed);
        self.set_state(GroupCallState::Initialized);
        Ok(())
    }

    async fn enter(&mut self) -> Result<(), CallError> {
        if !matches!(
            self.state,
            GroupCallState::Uninitialized | GroupCallState::Initialized
        ) {
            return Err(CallError::InvalidState {
                operation: "enter",
                state: self.state,
            });
        }
        if self.leave_token.is_cancelled() {
            return Err(CallError::InvalidState {
                operation: "enter",
                state: GroupCallState::Ended,
            });
        }

        info!(
            target: "call.actor.session",
            call_id = %self.descriptor.call_id,
            "Entering call"
        );

        if let Err(e) = self.try_enter().await {
            warn!(
                target: "call.actor.session",
                call_id = %self.descriptor.call_id,
                error = %e,
                "Enter failed, rolling back"
            );
            self.rollback_enter().await;
            return Err(e);
        }
        Ok(())
    }

    async fn try_enter(&mut self) -> Result<(), CallError> {
        if !self.mesh.has_local_feed(FeedPurpose::Usermedia) {
            let feed = self.media.acquire_local_media(FeedPurpose::Usermedia).await?;
            self.mesh.set_local_feed(feed);
        }

        let mut changes = self.store.subscribe(&self.descriptor.room_id).await?;
        while let Ok(change_set) = changes.try_recv() {
            self.view.apply(change_set);
        }
        self.changes = Some(changes);

        self.publish_announcement().await?;
        self.set_state(GroupCallState::Entered);

        self.reconcile().await;
        self.schedule_refresh(self.config.refresh_interval);
        Ok(())
    }

    async fn rollback_enter(&mut self) {
        if self.membership_expires_at_ms.take().is_some() {
            if let Err(e) = self.store.retract(&self.local, &self.descriptor).await {
                warn!(
                    target: "call.actor.session",
                    call_id = %self.descriptor.call_id,
                    error = %e,
                    "Failed to retract announcement during rollback"
                );
            }
        }
        self.changes = None;
        self.view = AnnouncementView::new();
        self.clear_timers();
        self.release_local_media().await;
        self.set_state(GroupCallState::Uninitialized);
    }

    /// Leave the call. No-op once ended.
    async fn leave(&mut self) {
        if self.state == GroupCallState::Ended {
            return;
        }
        info!(
            target: "call.actor.session",
            call_id = %self.descriptor.call_id,
            peers = self.mesh.peer_count(),
            "Leaving call"
        );

        if self.membership_expires_at_ms.take().is_some() {
            if let Err(e) = self.store.retract(&self.local, &self.descriptor).await {
                warn!(
                    target: "call.actor.session",
                    call_id = %self.descriptor.call_id,
                    error = %e,
                    "Failed to retract announcement, it will expire on its own"
                );
            }
        }

        self.mesh.teardown_all().await;
        self.participants.clear();
        self.pending_departures.clear();
        self.clear_timers();
        self.changes = None;
        self.release_local_media().await;
        self.set_state(GroupCallState::Ended);
    }

    async fn release_local_media(&mut self) {
        for feed in self.mesh.take_local_feeds() {
            if let Err(e) = self.media.release_local_media(feed.purpose).await {
                warn!(
                    target: "call.actor.session",
                    purpose = feed.purpose.as_str(),
                    error = %e,
                    "Failed to release local media"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Announcements
    // ------------------------------------------------------------------------

    async fn publish_announcement(&mut self) -> Result<(), CallError> {
        let ttl_ms = i64::try_from(self.config.announcement_ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = now_ms().saturating_add(ttl_ms);

        let request = PublishRequest {
            descriptor: self.descriptor.clone(),
            participant: self.local.clone(),
            session_id: self.session_id.clone(),
            expires_at_ms,
            feeds: self.mesh.local_feeds(),
        };

        match self.store.publish(&request).await {
            Ok(announcement_id) => {
                debug!(
                    target: "call.actor.session",
                    call_id = %self.descriptor.call_id,
                    announcement_id = %announcement_id,
                    expires_at_ms,
                    "Announcement published"
                );
                self.membership_expires_at_ms = Some(expires_at_ms);
                metrics::record_announcement_publish("success");
                Ok(())
            }
            Err(e) => {
                metrics::record_announcement_publish("error");
                Err(e)
            }
        }
    }

    fn schedule_refresh(&mut self, delay: Duration) {
        self.refresh_generation += 1;
        self.schedule(
            SessionTimer::RefreshAnnouncement {
                generation: self.refresh_generation,
            },
            delay,
        );
    }

    async fn on_refresh(&mut self, generation: u64) {
        if self.state != GroupCallState::Entered || generation != self.refresh_generation {
            return;
        }
        match self.publish_announcement().await {
            Ok(()) => self.schedule_refresh(self.config.refresh_interval),
            Err(e) => {
                warn!(
                    target: "call.actor.session",
                    call_id = %self.descriptor.call_id,
                    error = %e,
                    retry_secs = self.config.refresh_retry_delay.as_secs(),
                    "Re-announcement failed, retrying"
                );
                self.schedule_refresh(self.config.refresh_retry_delay);
            }
        }
    }

    async fn handle_change_set(&mut self, change_set: AnnouncementChangeSet) {
        if change_set.room_id != self.descriptor.room_id {
            return;
        }
        if self.resync_pending {
            self.view = AnnouncementView::new();
            self.resync_pending = false;
        }
        self.view.apply(change_set);
        self.reconcile().await;
    }

    fn on_change_stream_ended(&mut self) {
        self.changes = None;
        if self.state == GroupCallState::Entered {
            warn!(
                target: "call.actor.session",
                call_id = %self.descriptor.call_id,
                "Announcement stream ended, re-subscribing"
            );
            self.schedule(SessionTimer::Resubscribe, self.config.resubscribe_delay);
        }
    }

    async fn resubscribe(&mut self) {
        if self.state != GroupCallState::Entered || self.changes.is_some() {
            return;
        }
        match self.store.subscribe(&self.descriptor.room_id).await {
            Ok(changes) => {
                info!(
                    target: "call.actor.session",
                    call_id = %self.descriptor.call_id,
                    "Re-subscribed to announcements"
                );
                self.changes = Some(changes);
                self.resync_pending = true;
            }
            Err(e) => {
                warn!(
                    target: "call.actor.session",
                    call_id = %self.descriptor.call_id,
                    error = %e,
                    "Re-subscribe failed"
                );
                self.schedule(SessionTimer::Resubscribe, self.config.resubscribe_delay);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    async fn reconcile(&mut self) {
        if self.state != GroupCallState::Entered {
            return;
        }
        metrics::record_reconciliation();

        let now = now_ms();
        let members = membership::candidate_participants(
            &self.local,
            &self.session_id,
            &self.view,
            &self.descriptor,
            now,
        );
        let candidates: BTreeSet<ParticipantId> = members.keys().cloned().collect();
        let diff = membership::diff(&self.participants, &candidates);

        let reappeared: Vec<ParticipantId> = self
            .pending_departures
            .keys()
            .filter(|p| candidates.contains(*p))
            .cloned()
            .collect();
        for participant in reappeared {
            self.pending_departures.remove(&participant);
            metrics::record_departure_suppressed();
            debug!(
                target: "call.actor.session",
                participant = %participant,
                "Participant reappeared, departure suppressed"
            );
        }

        let departing: Vec<ParticipantId> = diff
            .left
            .into_iter()
            .filter(|p| !self.pending_departures.contains_key(p))
            .collect();
        if !departing.is_empty() {
            debug!(
                target: "call.actor.session",
                call_id = %self.descriptor.call_id,
                count = departing.len(),
                "Departures pending settle delay"
            );
            self.settle_generation += 1;
            let generation = self.settle_generation;
            self.pending_departures
                .extend(departing.iter().map(|p| (p.clone(), generation)));
            self.schedule(
                SessionTimer::SettleRecheck {
                    candidates: departing,
                    generation,
                },
                self.config.settle_delay,
            );
        }

        for (remote, remote_session) in &members {
            if remote == &self.local || self.pending_departures.contains_key(remote) {
                continue;
            }
            if self.leave_token.is_cancelled() {
                debug!(
                    target: "call.actor.session",
                    call_id = %self.descriptor.call_id,
                    "Leave requested, stopping setup batch"
                );
                break;
            }

            if let Some(current) = self.mesh.peer_session(remote) {
                if current == remote_session {
                    continue;
                }
                info!(
                    target: "call.actor.session",
                    remote = %remote,
                    "Participant re-announced with a new session, reconnecting"
                );
                self.mesh.discard(remote).await;
            }
            if self.mesh.has_connection_or_setup(remote) {
                continue;
            }

            self.setup_peer(remote, remote_session).await;

            if self.leave_token.is_cancelled() {
                self.mesh.teardown(remote).await;
                break;
            }
        }

        if !diff.joined.is_empty() {
            self.participants.extend(diff.joined.iter().cloned());
            let joined: Vec<ParticipantId> = diff.joined.into_iter().collect();
            metrics::record_participants_changed("joined", joined.len());
            info!(
                target: "call.actor.session",
                call_id = %self.descriptor.call_id,
                joined = joined.len(),
                total = self.participants.len(),
                "Participants joined"
            );
            let _ = self
                .events_tx
                .send(GroupCallEvent::ParticipantsJoined(joined));
        }

        self.schedule_expiry_check(now);
    }

    async fn setup_peer(&mut self, remote: &ParticipantId, remote_session: &SessionId) {
        match self.mesh.begin_setup(remote, remote_session) {
            Ok(SetupPlan::InitiateNow) => {
                // Failures are logged and counted by the mesh.
                let _ = self.mesh.initiate(remote, remote_session).await;
            }
            Ok(SetupPlan::AwaitRemote {
                timeout,
                generation,
            }) => {
                self.schedule(
                    SessionTimer::TieBreakDeadline {
                        participant: remote.clone(),
                        generation,
                    },
                    timeout,
                );
            }
            Ok(SetupPlan::AlreadyActive | SetupPlan::Escalated) => {}
            Err(e) => {
                debug!(
                    target: "call.actor.session",
                    remote = %remote,
                    error = %e,
                    "Peer setup skipped"
                );
            }
        }
    }

    async fn on_settle(&mut self, candidates: Vec<ParticipantId>, generation: u64) {
        if self.state != GroupCallState::Entered {
            return;
        }

        let members = membership::candidate_participants(
            &self.local,
            &self.session_id,
            &self.view,
            &self.descriptor,
            now_ms(),
        );

        let mut confirmed = Vec::new();
        for participant in candidates {
            // A newer absence owns the entry and its own recheck.
            if self.pending_departures.get(&participant) != Some(&generation) {
                continue;
            }
            self.pending_departures.remove(&participant);
            if members.contains_key(&participant) {
                metrics::record_departure_suppressed();
                continue;
            }
            confirmed.push(participant);
        }
        if confirmed.is_empty() {
            return;
        }

        for participant in &confirmed {
            self.mesh.teardown(participant).await;
            self.participants.remove(participant);
        }
        metrics::record_participants_changed("left", confirmed.len());
        info!(
            target: "call.actor.session",
            call_id = %self.descriptor.call_id,
            left = confirmed.len(),
            total = self.participants.len(),
            "Participants left"
        );
        let _ = self
            .events_tx
            .send(GroupCallEvent::ParticipantsLeft(confirmed));

        if self.participants.len() == 1 && self.participants.contains(&self.local) {
            info!(
                target: "call.actor.session",
                call_id = %self.descriptor.call_id,
                "Only the local device remains, leaving call"
            );
            self.leave_token.cancel();
            self.leave().await;
        }
    }

    fn schedule_expiry_check(&mut self, now: i64) {
        let Some(next_expiry) = self.view.next_expiry(&self.descriptor, now) else {
            if let Some(key) = self.expiry_key.take() {
                self.timers.remove(&key);
            }
            return;
        };

        let remaining_ms = u64::try_from(next_expiry.saturating_sub(now)).unwrap_or(0);
        let delay = Duration::from_millis(remaining_ms)
            .saturating_add(EXPIRY_SLACK)
            .min(MAX_TIMER_DELAY);
        match &self.expiry_key {
            Some(key) => self.timers.reset(key, delay),
            None => {
                self.expiry_key = Some(self.schedule(SessionTimer::MembershipExpiry, delay));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers and events
    // ------------------------------------------------------------------------

    /// Arm a timer. Delays past `MAX_TIMER_DELAY` are clamped to it.
    fn schedule(&mut self, timer: SessionTimer, delay: Duration) -> delay_queue::Key {
        self.timers.insert(timer, delay.min(MAX_TIMER_DELAY))
    }

    fn clear_timers(&mut self) {
        self.timers.clear();
        self.expiry_key = None;
        self.decay_key = None;
    }

    async fn handle_timer(&mut self, timer: SessionTimer) {
        debug!(
            target: "call.actor.session",
            call_id = %self.descriptor.call_id,
            timer = timer.as_str(),
            "Timer fired"
        );

        match timer {
            SessionTimer::RefreshAnnouncement { generation } => self.on_refresh(generation).await,
            SessionTimer::SettleRecheck {
                candidates,
                generation,
            } => self.on_settle(candidates, generation).await,
            SessionTimer::TieBreakDeadline {
                participant,
                generation,
            } => self.on_tie_break_deadline(&participant, generation).await,
            SessionTimer::MembershipExpiry => {
                self.expiry_key = None;
                self.reconcile().await;
            }
            SessionTimer::ReactionDecay => {
                self.decay_key = None;
                if self.reactions.decay() {
                    self.schedule_decay();
                }
            }
            SessionTimer::Resubscribe => self.resubscribe().await,
        }
    }

    async fn on_tie_break_deadline(&mut self, participant: &ParticipantId, generation: u64) {
        if self.state != GroupCallState::Entered || self.leave_token.is_cancelled() {
            return;
        }
        // Failures are logged and counted by the mesh.
        let _ = self.mesh.on_await_deadline(participant, generation).await;

        if self.leave_token.is_cancelled() {
            self.mesh.teardown(participant).await;
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(remote) = self.mesh.on_connection_event(event).await else {
            return;
        };

        if self.state != GroupCallState::Entered
            || self.leave_token.is_cancelled()
            || !self.participants.contains(&remote)
            || self.pending_departures.contains_key(&remote)
        {
            return;
        }

        let members = self.view.members_of(&self.descriptor, now_ms());
        if let Some(remote_session) = members.get(&remote) {
            info!(
                target: "call.actor.session",
                remote = %remote,
                "Connection failed, setting up again"
            );
            self.setup_peer(&remote, remote_session).await;
        }
    }

    async fn handle_signaling(&mut self, envelope: SignalingEnvelope) {
        if self.state != GroupCallState::Entered || self.leave_token.is_cancelled() {
            debug!(
                target: "call.actor.session",
                call_id = %self.descriptor.call_id,
                kind = envelope.payload.kind(),
                state = %self.state,
                "Dropping signaling, not in call"
            );
            metrics::record_signaling_dropped("not_entered");
            return;
        }
        if envelope.room_id != self.descriptor.room_id
            || envelope.call_id != self.descriptor.call_id
        {
            metrics::record_signaling_dropped("unknown_call");
            return;
        }
        if envelope.sender == self.local {
            metrics::record_signaling_dropped("loopback");
            return;
        }

        let SignalingEnvelope {
            sender,
            sender_session_id,
            payload,
            ..
        } = envelope;

        debug!(
            target: "call.actor.session",
            remote = %sender,
            kind = payload.kind(),
            "Signaling received"
        );

        match payload {
            SignalingPayload::Offer { sdp } => {
                if let Err(e) = self.mesh.handle_offer(&sender, &sender_session_id, &sdp).await {
                    debug!(
                        target: "call.actor.session",
                        remote = %sender,
                        error = %e,
                        "Offer not accepted"
                    );
                }
                if self.leave_token.is_cancelled() {
                    self.mesh.teardown(&sender).await;
                }
            }
            SignalingPayload::Answer { sdp } => {
                if let Err(e) = self.mesh.handle_answer(&sender, &sender_session_id, &sdp).await {
                    debug!(
                        target: "call.actor.session",
                        remote = %sender,
                        error = %e,
                        "Answer not applied"
                    );
                }
            }
            SignalingPayload::Candidates { candidates } => {
                self.mesh
                    .handle_candidates(&sender, &sender_session_id, candidates)
                    .await;
            }
            SignalingPayload::MetadataChanged {
                audio_muted,
                video_muted,
            } => {
                self.mesh
                    .handle_remote_metadata(&sender, audio_muted, video_muted);
            }
            SignalingPayload::Hangup { reason } => {
                if self
                    .mesh
                    .handle_remote_hangup(&sender, &sender_session_id)
                    .await
                {
                    debug!(
                        target: "call.actor.session",
                        remote = %sender,
                        reason = ?reason,
                        "Peer hung up"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Media and reactions
    // ------------------------------------------------------------------------

    async fn set_device_muted(&mut self, kind: DeviceKind, muted: bool) -> Result<(), CallError> {
        if !matches!(
            self.state,
            GroupCallState::Initialized | GroupCallState::Entered
        ) {
            return Err(CallError::InvalidState {
                operation: "set device muted",
                state: self.state,
            });
        }

        self.media.set_device_muted(kind, muted).await?;

        let (mut audio_muted, mut video_muted) = self.mesh.local_mute_state();
        match kind {
            DeviceKind::Microphone => audio_muted = muted,
            DeviceKind::Camera => video_muted = muted,
        }
        self.mesh.broadcast_metadata(audio_muted, video_muted).await;
        Ok(())
    }

    async fn set_screensharing_enabled(&mut self, enabled: bool) -> Result<(), CallError> {
        if self.state != GroupCallState::Entered {
            return Err(CallError::InvalidState {
                operation: "set screensharing",
                state: self.state,
            });
        }
        if enabled == self.mesh.has_local_feed(FeedPurpose::Screenshare) {
            return Ok(());
        }

        if enabled {
            let feed = self
                .media
                .acquire_local_media(FeedPurpose::Screenshare)
                .await?;
            self.mesh.attach_feed_all(feed).await;
        } else if self
            .mesh
            .detach_feed_all(FeedPurpose::Screenshare)
            .await
            .is_some()
        {
            if let Err(e) = self.media.release_local_media(FeedPurpose::Screenshare).await {
                warn!(
                    target: "call.actor.session",
                    error = %e,
                    "Failed to release screenshare"
                );
            }
        }

        self.mesh.renegotiate_all().await;

        if let Err(e) = self.publish_announcement().await {
            warn!(
                target: "call.actor.session",
                call_id = %self.descriptor.call_id,
                error = %e,
                "Failed to republish announcement with updated feeds"
            );
        }

        info!(
            target: "call.actor.session",
            call_id = %self.descriptor.call_id,
            enabled,
            "Screensharing updated"
        );
        Ok(())
    }

    async fn send_reaction(&mut self, key: String, ephemeral: bool) -> Result<String, CallError> {
        let live_membership = self.state == GroupCallState::Entered
            && self
                .membership_expires_at_ms
                .is_some_and(|expires_at_ms| expires_at_ms > now_ms());
        if !live_membership {
            return Err(CallError::MissingMembership);
        }

        if ephemeral {
            if let Err(e) = self.reactions.try_acquire() {
                metrics::record_reaction("throttled");
                debug!(
                    target: "call.actor.session",
                    call_id = %self.descriptor.call_id,
                    outstanding = self.reactions.outstanding(),
                    "Reaction throttled"
                );
                return Err(e);
            }
            self.schedule_decay();
        }

        let reaction = Reaction {
            call_id: self.descriptor.call_id.clone(),
            sender: self.local.clone(),
            key,
            ephemeral,
        };
        match self
            .sender
            .send_reaction(&self.descriptor.room_id, &reaction)
            .await
        {
            Ok(event_id) => {
                metrics::record_reaction("sent");
                Ok(event_id)
            }
            Err(e) => {
                metrics::record_reaction("error");
                Err(e)
            }
        }
    }

    fn schedule_decay(&mut self) {
        if self.decay_key.is_none() {
            self.decay_key = Some(
                self.schedule(SessionTimer::ReactionDecay, self.config.reaction_decay_interval),
            );
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let (audio_muted, video_muted) = self.mesh.local_mute_state();
        SessionSnapshot {
            descriptor: self.descriptor.clone(),
            local: self.local.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            participants: self.participants.iter().cloned().collect(),
            pending_departures: self.pending_departures.keys().cloned().collect(),
            peers: self.mesh.peer_states(),
            local_feeds: self
                .mesh
                .local_feeds()
                .into_iter()
                .map(|feed| feed.purpose)
                .collect(),
            audio_muted,
            video_muted,
            reactions_outstanding: self.reactions.outstanding(),
            mailbox_depth: self.mailbox.current_depth(),
        }
    }
}

async fn next_change_set(
    changes: &mut Option<mpsc::Receiver<AnnouncementChangeSet>>,
) -> Option<AnnouncementChangeSet> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
