//! Mock media engine.
//!
//! Records every call and hands out numbered connections whose events the
//! test drives with [`MockMediaTransport::set_connection_state`] and
//! [`MockMediaTransport::emit_local_candidate`].

use common::types::ParticipantId;
use mesh_call::announcement::{Feed, FeedPurpose};
use mesh_call::errors::CallError;
use mesh_call::media::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionState, DeviceKind,
    MediaTransport,
};
use mesh_call::signaling::{IceCandidate, SessionDescription};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

const CONNECTION_EVENT_BUFFER: usize = 64;

/// One connection created by the mock.
#[derive(Debug, Clone)]
pub struct MockConnection {
    pub handle: ConnectionHandle,
    pub config: ConnectionConfig,
    pub attached: BTreeSet<FeedPurpose>,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub remote_candidates: Vec<IceCandidate>,
    pub closed: bool,
    events: mpsc::Sender<ConnectionEvent>,
}

/// Mock media transport.
#[derive(Debug, Clone)]
pub struct MockMediaTransport {
    inner: Arc<Mutex<MockMediaInner>>,
}

#[derive(Debug, Default)]
struct MockMediaInner {
    next_handle: u64,
    /// Creation order.
    connections: Vec<MockConnection>,
    held: BTreeSet<FeedPurpose>,
    acquire_count: usize,
    release_count: usize,
    muted: HashMap<DeviceKind, bool>,
    fail_acquire: bool,
    fail_connections_to: HashSet<ParticipantId>,
    /// `create_connection` calls per remote, failed ones included.
    attempts: HashMap<ParticipantId, usize>,
    not_ready: bool,
    /// While set, `create_connection` waits until the gate is closed.
    gate: Option<Arc<Semaphore>>,
    held_at_gate: usize,
}

impl MockMediaInner {
    fn connection_mut(
        &mut self,
        handle: ConnectionHandle,
    ) -> Result<&mut MockConnection, CallError> {
        self.connections
            .iter_mut()
            .find(|c| c.handle == handle)
            .ok_or_else(|| CallError::Transport(format!("unknown connection {handle}")))
    }

    fn open_to(&self, remote: &ParticipantId) -> Option<&MockConnection> {
        self.connections
            .iter()
            .rev()
            .find(|c| &c.config.remote == remote && !c.closed)
    }
}

impl Default for MockMediaTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockMediaInner::default())),
        }
    }

    /// Make `acquire_local_media` fail.
    pub fn set_fail_acquire(&self, fail: bool) {
        self.inner.lock().unwrap().fail_acquire = fail;
    }

    /// Make `create_connection` fail for one remote.
    pub fn fail_connections_to(&self, remote: &ParticipantId) {
        self.inner
            .lock()
            .unwrap()
            .fail_connections_to
            .insert(remote.clone());
    }

    /// Let connections to `remote` be created again.
    pub fn allow_connections_to(&self, remote: &ParticipantId) {
        self.inner.lock().unwrap().fail_connections_to.remove(remote);
    }

    /// Report every connection as not ready for SDP operations.
    pub fn set_ready(&self, ready: bool) {
        self.inner.lock().unwrap().not_ready = !ready;
    }

    /// Hold every `create_connection` call until [`Self::release_connections`].
    pub fn hold_connections(&self) {
        self.inner.lock().unwrap().gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let held and future `create_connection` calls proceed.
    pub fn release_connections(&self) {
        if let Some(gate) = self.inner.lock().unwrap().gate.take() {
            gate.close();
        }
    }

    /// Number of `create_connection` calls currently held.
    pub fn held_connections(&self) -> usize {
        self.inner.lock().unwrap().held_at_gate
    }

    /// Push a state change on the open connection to `remote`.
    ///
    /// Returns `false` if there is no open connection.
    pub fn set_connection_state(&self, remote: &ParticipantId, state: ConnectionState) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .open_to(remote)
            .is_some_and(|c| c.events.try_send(ConnectionEvent::StateChanged(state)).is_ok())
    }

    /// Push a locally gathered candidate on the open connection to `remote`.
    pub fn emit_local_candidate(&self, remote: &ParticipantId, candidate: IceCandidate) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .open_to(remote)
            .is_some_and(|c| c.events.try_send(ConnectionEvent::LocalCandidate(candidate)).is_ok())
    }

    /// The open connection to `remote`, if any.
    pub fn connection_to(&self, remote: &ParticipantId) -> Option<MockConnection> {
        self.inner.lock().unwrap().open_to(remote).cloned()
    }

    /// Connections ever created to `remote`.
    pub fn connections_created_to(&self, remote: &ParticipantId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| &c.config.remote == remote)
            .count()
    }

    /// `create_connection` calls for `remote`, failed ones included.
    pub fn connection_attempts_to(&self, remote: &ParticipantId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .attempts
            .get(remote)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| !c.closed)
            .count()
    }

    /// Feeds currently captured.
    pub fn held_feeds(&self) -> Vec<FeedPurpose> {
        self.inner.lock().unwrap().held.iter().copied().collect()
    }

    pub fn acquire_count(&self) -> usize {
        self.inner.lock().unwrap().acquire_count
    }

    pub fn release_count(&self) -> usize {
        self.inner.lock().unwrap().release_count
    }

    pub fn is_muted(&self, kind: DeviceKind) -> bool {
        self.inner
            .lock()
            .unwrap()
            .muted
            .get(&kind)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl MediaTransport for MockMediaTransport {
    async fn acquire_local_media(&self, purpose: FeedPurpose) -> Result<Feed, CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_acquire {
            return Err(CallError::Transport("capture unavailable".to_string()));
        }
        inner.acquire_count += 1;
        inner.held.insert(purpose);
        Ok(Feed {
            stream_id: format!("local-{}", purpose.as_str()),
            purpose,
        })
    }

    async fn release_local_media(&self, purpose: FeedPurpose) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.release_count += 1;
        inner.held.remove(&purpose);
        Ok(())
    }

    async fn set_device_muted(&self, kind: DeviceKind, muted: bool) -> Result<(), CallError> {
        self.inner.lock().unwrap().muted.insert(kind, muted);
        Ok(())
    }

    async fn create_connection(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(ConnectionHandle, mpsc::Receiver<ConnectionEvent>), CallError> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            *inner.attempts.entry(config.remote.clone()).or_default() += 1;
            inner.gate.clone()
        };
        if let Some(gate) = gate {
            self.inner.lock().unwrap().held_at_gate += 1;
            // Errors once the gate is closed.
            let _ = gate.acquire().await;
            self.inner.lock().unwrap().held_at_gate -= 1;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_connections_to.contains(&config.remote) {
            return Err(CallError::Transport(format!(
                "cannot reach {}",
                config.remote
            )));
        }

        inner.next_handle += 1;
        let handle = ConnectionHandle(inner.next_handle);
        let (events, rx) = mpsc::channel(CONNECTION_EVENT_BUFFER);
        inner.connections.push(MockConnection {
            handle,
            config: config.clone(),
            attached: BTreeSet::new(),
            local_description: None,
            remote_description: None,
            remote_candidates: Vec::new(),
            closed: false,
            events,
        });
        Ok((handle, rx))
    }

    async fn attach_local_media(
        &self,
        handle: ConnectionHandle,
        feed: &Feed,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connection_mut(handle)?.attached.insert(feed.purpose);
        Ok(())
    }

    async fn detach_local_media(
        &self,
        handle: ConnectionHandle,
        purpose: FeedPurpose,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connection_mut(handle)?.attached.remove(&purpose);
        Ok(())
    }

    async fn create_offer(
        &self,
        handle: ConnectionHandle,
    ) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::offer(format!("offer-from-{handle}")))
    }

    async fn create_answer(
        &self,
        handle: ConnectionHandle,
    ) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::answer(format!("answer-from-{handle}")))
    }

    async fn set_local_description(
        &self,
        handle: ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connection_mut(handle)?.local_description = Some(description.clone());
        Ok(())
    }

    async fn set_remote_description(
        &self,
        handle: ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connection_mut(handle)?.remote_description = Some(description.clone());
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        handle: ConnectionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .connection_mut(handle)?
            .remote_candidates
            .push(candidate.clone());
        Ok(())
    }

    fn is_ready(&self, handle: ConnectionHandle) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.not_ready
            && inner
                .connections
                .iter()
                .any(|c| c.handle == handle && !c.closed)
    }

    async fn close_connection(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Ok(connection) = inner.connection_mut(handle) {
            connection.closed = true;
        }
    }
}
