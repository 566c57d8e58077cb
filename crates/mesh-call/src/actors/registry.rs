//! `CallRegistryActor` - singleton supervisor for group call sessions.
//!
//! The `CallRegistryActor` is the top-level actor of the coordinator:
//!
//! - Singleton per process (one local device identity)
//! - Supervises N `GroupCallActor` instances, at most one per `(room, call)`
//! - Routes inbound signaling to the owning session
//! - Owns the circuit breaker board shared by every session
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On shutdown, the registry:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all sessions)
//! 3. Waits up to the shutdown deadline for each session to leave its call

use crate::announcement::CallDescriptor;
use crate::config::Config;
use crate::errors::CallError;
use crate::mesh::CircuitBreakerBoard;
use crate::observability::metrics;
use crate::signaling::SignalingEnvelope;

use super::messages::{GroupCallState, RegistryEvent, RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{CallCapabilities, GroupCallActor, GroupCallHandle};

use common::types::{CallId, ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Capacity of the registry event broadcast.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Time allowed for a removed session to leave its call.
const REMOVE_LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-session deadline when the registry is cancelled directly.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

type SessionKey = (RoomId, CallId);

/// Handle to the `CallRegistryActor`.
///
/// This is the public interface for interacting with the registry.
#[derive(Clone)]
pub struct CallRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    events_tx: broadcast::Sender<RegistryEvent>,
}

impl CallRegistryHandle {
    /// Create a new `CallRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    ///
    /// # Arguments
    ///
    /// * `local` - Identity of this device
    /// * `capabilities` - Store, media engine and sender shared by every session
    /// * `config` - Timings and thresholds
    /// * `metrics` - Shared actor metrics
    #[must_use]
    pub fn new(
        local: ParticipantId,
        capabilities: CallCapabilities,
        config: Config,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        let actor = CallRegistryActor::new(
            local,
            capabilities,
            config,
            receiver,
            cancel_token.clone(),
            events_tx.clone(),
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            events_tx,
        }
    }

    /// Create a session for a call the local user wants to join.
    ///
    /// Fails with `Conflict` if the call already has a session.
    pub async fn create_session(
        &self,
        room_id: RoomId,
        call_id: CallId,
    ) -> Result<GroupCallHandle, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CreateSession {
                room_id,
                call_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Register a call observed in a room.
    ///
    /// Returns the existing session if there is one; otherwise creates it and
    /// publishes `RegistryEvent::IncomingCall`.
    pub async fn incoming_call(
        &self,
        room_id: RoomId,
        call_id: CallId,
    ) -> Result<GroupCallHandle, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::IncomingCall {
                room_id,
                call_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_session(
        &self,
        room_id: RoomId,
        call_id: CallId,
    ) -> Result<GroupCallHandle, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetSession {
                room_id,
                call_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave and drop a session.
    pub async fn remove_session(&self, room_id: RoomId, call_id: CallId) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::RemoveSession {
                room_id,
                call_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Route inbound signaling to the session for its `(room, call)`.
    pub async fn dispatch(&self, envelope: SignalingEnvelope) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Dispatch {
                envelope,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Subscribe to registry events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown. Each session gets `deadline` to leave.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a managed session.
struct ManagedSession {
    handle: GroupCallHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
    created_at: i64,
}

/// The `CallRegistryActor` implementation.
pub struct CallRegistryActor {
    local: ParticipantId,
    capabilities: CallCapabilities,
    config: Arc<Config>,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    events_tx: broadcast::Sender<RegistryEvent>,
    sessions: HashMap<SessionKey, ManagedSession>,
    breakers: CircuitBreakerBoard,
    /// Whether the registry is accepting new sessions.
    accepting_new: bool,
    shutdown_deadline: Duration,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl CallRegistryActor {
    fn new(
        local: ParticipantId,
        capabilities: CallCapabilities,
        config: Config,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
        events_tx: broadcast::Sender<RegistryEvent>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Registry, local.to_string());
        let breakers =
            CircuitBreakerBoard::new(config.breaker_failure_threshold, config.breaker_cooldown);

        Self {
            local,
            capabilities,
            config: Arc::new(config),
            receiver,
            cancel_token,
            events_tx,
            sessions: HashMap::new(),
            breakers,
            accepting_new: true,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            metrics,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "call.actor.registry", fields(local = %self.local))]
    async fn run(mut self) {
        info!(
            target: "call.actor.registry",
            local = %self.local,
            "CallRegistryActor started"
        );

        loop {
            // Reap sessions that have ended or died.
            self.check_session_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "call.actor.registry",
                        local = %self.local,
                        "CallRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
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
                                target: "call.actor.registry",
                                local = %self.local,
                                "CallRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "call.actor.registry",
            local = %self.local,
            sessions_remaining = self.sessions.len(),
            messages_processed = self.mailbox.messages_processed(),
            "CallRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateSession {
                room_id,
                call_id,
                respond_to,
            } => {
                let result = self.create_session(room_id, call_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::IncomingCall {
                room_id,
                call_id,
                respond_to,
            } => {
                let result = self.incoming_call(room_id, call_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetSession {
                room_id,
                call_id,
                respond_to,
            } => {
                let result = self.get_session(&room_id, &call_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::RemoveSession {
                room_id,
                call_id,
                respond_to,
            } => {
                let result = self.remove_session(room_id, call_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::Dispatch {
                envelope,
                respond_to,
            } => {
                let result = self.dispatch(envelope).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.initiate_shutdown(deadline);
                let _ = respond_to.send(result);
            }
        }
    }

    fn create_session(
        &mut self,
        room_id: RoomId,
        call_id: CallId,
    ) -> Result<GroupCallHandle, CallError> {
        if !self.accepting_new {
            return Err(CallError::Draining);
        }

        let key = (room_id, call_id);
        if self.is_live(&key) {
            return Err(CallError::Conflict("Session already exists".to_string()));
        }

        Ok(self.spawn_session(key))
    }

    fn incoming_call(
        &mut self,
        room_id: RoomId,
        call_id: CallId,
    ) -> Result<GroupCallHandle, CallError> {
        let key = (room_id, call_id);
        if self.is_live(&key) {
            if let Some(managed) = self.sessions.get(&key) {
                return Ok(managed.handle.clone());
            }
        }
        if !self.accepting_new {
            return Err(CallError::Draining);
        }

        let handle = self.spawn_session(key);
        let _ = self
            .events_tx
            .send(RegistryEvent::IncomingCall(handle.descriptor().clone()));
        Ok(handle)
    }

    /// A session exists for `key` and has not ended.
    fn is_live(&self, key: &SessionKey) -> bool {
        self.sessions
            .get(key)
            .is_some_and(|m| m.handle.state() != GroupCallState::Ended)
    }

    fn spawn_session(&mut self, key: SessionKey) -> GroupCallHandle {
        if let Some(stale) = self.sessions.remove(&key) {
            debug!(
                target: "call.actor.registry",
                room_id = %key.0,
                call_id = %key.1,
                "Replacing ended session"
            );
            stale.handle.cancel();
            self.metrics.session_removed();
        }

        let (room_id, call_id) = key;
        let descriptor = CallDescriptor::new(room_id.clone(), call_id.clone(), &self.config);

        let (handle, task_handle) = GroupCallActor::spawn(
            descriptor,
            self.local.clone(),
            Arc::clone(&self.config),
            self.capabilities.clone(),
            self.breakers.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.sessions.insert(
            (room_id.clone(), call_id.clone()),
            ManagedSession {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.session_created();

        info!(
            target: "call.actor.registry",
            room_id = %room_id,
            call_id = %call_id,
            total_sessions = self.sessions.len(),
            "Session actor created"
        );

        handle
    }

    fn get_session(
        &self,
        room_id: &RoomId,
        call_id: &CallId,
    ) -> Result<GroupCallHandle, CallError> {
        self.sessions
            .get(&(room_id.clone(), call_id.clone()))
            .map(|managed| managed.handle.clone())
            .ok_or_else(|| CallError::CallNotFound(format!("{room_id}/{call_id}")))
    }

    /// Remove a session.
    ///
    /// Does not block the message loop: leaving, cancelling and waiting for
    /// the task happen in a background task.
    fn remove_session(&mut self, room_id: RoomId, call_id: CallId) -> Result<(), CallError> {
        let Some(managed) = self.sessions.remove(&(room_id.clone(), call_id.clone())) else {
            return Err(CallError::CallNotFound(format!("{room_id}/{call_id}")));
        };

        debug!(
            target: "call.actor.registry",
            room_id = %room_id,
            call_id = %call_id,
            age_secs = chrono::Utc::now().timestamp() - managed.created_at,
            "Removing session actor"
        );

        let call_id_owned = call_id.clone();
        tokio::spawn(async move {
            let ManagedSession {
                handle,
                task_handle,
                ..
            } = managed;

            if tokio::time::timeout(REMOVE_LEAVE_TIMEOUT, handle.leave())
                .await
                .is_err()
            {
                warn!(
                    target: "call.actor.registry",
                    call_id = %call_id_owned,
                    "Session leave timed out, cancelling"
                );
            }
            handle.cancel();

            match tokio::time::timeout(REMOVE_LEAVE_TIMEOUT, task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "call.actor.registry",
                        call_id = %call_id_owned,
                        "Session actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "call.actor.registry",
                        call_id = %call_id_owned,
                        error = ?e,
                        "Session actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "call.actor.registry",
                        call_id = %call_id_owned,
                        "Session actor task cleanup timed out"
                    );
                }
            }
        });

        self.metrics.session_removed();

        info!(
            target: "call.actor.registry",
            room_id = %room_id,
            call_id = %call_id,
            total_sessions = self.sessions.len(),
            "Session actor removed"
        );

        Ok(())
    }

    async fn dispatch(&mut self, envelope: SignalingEnvelope) -> Result<(), CallError> {
        let key = (envelope.room_id.clone(), envelope.call_id.clone());
        let Some(managed) = self.sessions.get(&key) else {
            debug!(
                target: "call.actor.registry",
                room_id = %key.0,
                call_id = %key.1,
                kind = envelope.payload.kind(),
                "No session for signaling, dropping"
            );
            metrics::record_signaling_dropped("unknown_call");
            return Err(CallError::CallNotFound(format!("{}/{}", key.0, key.1)));
        };

        managed
            .handle
            .deliver_signaling(envelope)
            .await
            .map_err(|_| CallError::CallNotFound(format!("{}/{}", key.0, key.1)))
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            session_count: self.sessions.len(),
            entered_count: self
                .sessions
                .values()
                .filter(|m| m.handle.state() == GroupCallState::Entered)
                .count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn initiate_shutdown(&mut self, deadline: Duration) -> Result<(), CallError> {
        info!(
            target: "call.actor.registry",
            local = %self.local,
            session_count = self.sessions.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.shutdown_deadline = deadline;

        // Cancel the root token (propagates to all sessions)
        self.cancel_token.cancel();

        Ok(())
    }

    /// Wait for every session to leave its call.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "call.actor.registry",
            local = %self.local,
            session_count = self.sessions.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.sessions.values() {
            managed.handle.cancel();
        }

        for ((_, call_id), managed) in self.sessions.drain() {
            match tokio::time::timeout(self.shutdown_deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "call.actor.registry",
                        call_id = %call_id,
                        "Session actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "call.actor.registry",
                        call_id = %call_id,
                        error = ?e,
                        "Session actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "call.actor.registry",
                        call_id = %call_id,
                        "Session actor shutdown timed out"
                    );
                }
            }
            self.metrics.session_removed();
        }

        info!(
            target: "call.actor.registry",
            local = %self.local,
            "Graceful shutdown complete"
        );
    }

    /// Reap session actors whose task has finished.
    async fn check_session_health(&mut self) {
        let finished: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();

        for key in finished {
            let Some(managed) = self.sessions.remove(&key) else {
                continue;
            };
            let ended = managed.handle.state() == GroupCallState::Ended;

            match managed.task_handle.await {
                Ok(()) => {
                    if ended {
                        debug!(
                            target: "call.actor.registry",
                            call_id = %key.1,
                            "Session actor exited after leaving"
                        );
                    } else {
                        warn!(
                            target: "call.actor.registry",
                            call_id = %key.1,
                            "Session actor task finished unexpectedly"
                        );
                    }
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "call.actor.registry",
                            call_id = %key.1,
                            error = ?join_error,
                            "Session actor panicked - triggering investigation"
                        );
                        self.metrics.record_panic(ActorType::Session);
                    }
                }
            }

            self.metrics.session_removed();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::announcement::{
        AnnouncementChangeSet, AnnouncementStore, Feed, FeedPurpose, PublishRequest,
    };
    use crate::media::{
        ConnectionConfig, ConnectionEvent, ConnectionHandle, DeviceKind, MediaTransport,
    };
    use crate::signaling::{
        EventSender, IceCandidate, Reaction, SessionDescription, SignalingPayload,
    };
    use common::types::SessionId;

    /// Capabilities that accept everything and do nothing.
    struct Inert;

    #[async_trait::async_trait]
    impl AnnouncementStore for Inert {
        async fn publish(&self, _request: &PublishRequest) -> Result<String, CallError> {
            Ok("$announcement".to_string())
        }
        async fn retract(
            &self,
            _participant: &ParticipantId,
            _descriptor: &CallDescriptor,
        ) -> Result<(), CallError> {
            Ok(())
        }
        async fn subscribe(
            &self,
            _room_id: &RoomId,
        ) -> Result<mpsc::Receiver<AnnouncementChangeSet>, CallError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[async_trait::async_trait]
    impl EventSender for Inert {
        async fn send_to_device(
            &self,
            _target: &ParticipantId,
            _envelope: &SignalingEnvelope,
        ) -> Result<(), CallError> {
            Ok(())
        }
        async fn send_reaction(
            &self,
            _room_id: &RoomId,
            _reaction: &Reaction,
        ) -> Result<String, CallError> {
            Ok("$reaction".to_string())
        }
    }

    #[async_trait::async_trait]
    impl MediaTransport for Inert {
        async fn acquire_local_media(&self, purpose: FeedPurpose) -> Result<Feed, CallError> {
            Ok(Feed {
                stream_id: format!("local-{}", purpose.as_str()),
                purpose,
            })
        }
        async fn release_local_media(&self, _purpose: FeedPurpose) -> Result<(), CallError> {
            Ok(())
        }
        async fn set_device_muted(&self, _kind: DeviceKind, _muted: bool) -> Result<(), CallError> {
            Ok(())
        }
        async fn create_connection(
            &self,
            _config: &ConnectionConfig,
        ) -> Result<(ConnectionHandle, mpsc::Receiver<ConnectionEvent>), CallError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok((ConnectionHandle(1), rx))
        }
        async fn attach_local_media(
            &self,
            _handle: ConnectionHandle,
            _feed: &Feed,
        ) -> Result<(), CallError> {
            Ok(())
        }
        async fn detach_local_media(
            &self,
            _handle: ConnectionHandle,
            _purpose: FeedPurpose,
        ) -> Result<(), CallError> {
            Ok(())
        }
        async fn create_offer(
            &self,
            _handle: ConnectionHandle,
        ) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription::offer("v=0"))
        }
        async fn create_answer(
            &self,
            _handle: ConnectionHandle,
        ) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription::answer("v=0"))
        }
        async fn set_local_description(
            &self,
            _handle: ConnectionHandle,
            _description: &SessionDescription,
        ) -> Result<(), CallError> {
            Ok(())
        }
        async fn set_remote_description(
            &self,
            _handle: ConnectionHandle,
            _description: &SessionDescription,
        ) -> Result<(), CallError> {
            Ok(())
        }
        async fn add_remote_candidate(
            &self,
            _handle: ConnectionHandle,
            _candidate: &IceCandidate,
        ) -> Result<(), CallError> {
            Ok(())
        }
        fn is_ready(&self, _handle: ConnectionHandle) -> bool {
            true
        }
        async fn close_connection(&self, _handle: ConnectionHandle) {}
    }

    fn registry() -> CallRegistryHandle {
        let inert = Arc::new(Inert);
        let capabilities = CallCapabilities {
            store: inert.clone(),
            media: inert.clone(),
            sender: inert,
        };
        CallRegistryHandle::new(
            ParticipantId::new("@alice:example.org", "ALICE"),
            capabilities,
            Config::default(),
            ActorMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_registry_create_and_get_session() {
        let handle = registry();

        let session = handle
            .create_session(RoomId::from("!room"), CallId::from("call-1"))
            .await
            .unwrap();
        assert_eq!(session.descriptor().call_id, CallId::from("call-1"));
        assert_eq!(session.state(), GroupCallState::Uninitialized);

        let fetched = handle
            .get_session(RoomId::from("!room"), CallId::from("call-1"))
            .await
            .unwrap();
        assert_eq!(fetched.session_id(), session.session_id());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_registry_duplicate_session() {
        let handle = registry();

        handle
            .create_session(RoomId::from("!room"), CallId::from("call-1"))
            .await
            .unwrap();
        let result = handle
            .create_session(RoomId::from("!room"), CallId::from("call-1"))
            .await;
        assert!(matches!(result, Err(CallError::Conflict(_))));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_registry_get_nonexistent_session() {
        let handle = registry();

        let result = handle
            .get_session(RoomId::from("!room"), CallId::from("missing"))
            .await;
        assert!(matches!(result, Err(CallError::CallNotFound(_))));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_registry_dispatch_unknown_call() {
        let handle = registry();

        let envelope = SignalingEnvelope {
            room_id: RoomId::from("!room"),
            call_id: CallId::from("missing"),
            sender: ParticipantId::new("@bob:example.org", "BOB"),
            sender_session_id: SessionId::from("s-bob"),
            payload: SignalingPayload::Offer {
                sdp: "v=0".to_string(),
            },
        };
        let result = handle.dispatch(envelope).await;
        assert!(matches!(result, Err(CallError::CallNotFound(_))));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_registry_status_and_shutdown() {
        let handle = registry();

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.session_count, 0);
        assert!(!status.is_draining);

        let _ = handle
            .create_session(RoomId::from("!room"), CallId::from("c1"))
            .await;
        let _ = handle
            .create_session(RoomId::from("!room"), CallId::from("c2"))
            .await;
        let status = handle.get_status().await.unwrap();
        assert_eq!(status.session_count, 2);
        assert_eq!(status.entered_count, 0);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_cancelled());
    }
}
