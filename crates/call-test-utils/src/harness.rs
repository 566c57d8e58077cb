//! Wiring of mocks into sessions and registries.

use crate::fixtures;
use crate::mock_media::MockMediaTransport;
use crate::mock_sender::MockEventSender;
use crate::mock_store::MockAnnouncementStore;
use common::types::ParticipantId;
use mesh_call::actors::{
    ActorMetrics, CallCapabilities, CallRegistryHandle, GroupCallActor, GroupCallHandle,
};
use mesh_call::config::Config;
use mesh_call::mesh::CircuitBreakerBoard;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One local device with mocked collaborators.
#[derive(Debug, Clone)]
pub struct TestCall {
    pub local: ParticipantId,
    pub config: Config,
    pub store: MockAnnouncementStore,
    pub media: MockMediaTransport,
    pub sender: MockEventSender,
    pub breakers: CircuitBreakerBoard,
}

impl TestCall {
    #[must_use]
    pub fn new(local: ParticipantId) -> Self {
        let config = Config::default();
        Self {
            local,
            breakers: CircuitBreakerBoard::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown,
            ),
            config,
            store: MockAnnouncementStore::new(),
            media: MockMediaTransport::new(),
            sender: MockEventSender::new(),
        }
    }

    /// Replace the config (and rebuild the breaker board from it).
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.breakers =
            CircuitBreakerBoard::new(config.breaker_failure_threshold, config.breaker_cooldown);
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: MockAnnouncementStore) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn capabilities(&self) -> CallCapabilities {
        CallCapabilities {
            store: Arc::new(self.store.clone()),
            media: Arc::new(self.media.clone()),
            sender: Arc::new(self.sender.clone()),
        }
    }

    /// Spawn a session for the default call.
    #[must_use]
    pub fn spawn(&self) -> (GroupCallHandle, JoinHandle<()>) {
        GroupCallActor::spawn(
            fixtures::descriptor(),
            self.local.clone(),
            Arc::new(self.config.clone()),
            self.capabilities(),
            self.breakers.clone(),
            CancellationToken::new(),
            ActorMetrics::new(),
        )
    }

    #[must_use]
    pub fn registry(&self) -> CallRegistryHandle {
        CallRegistryHandle::new(
            self.local.clone(),
            self.capabilities(),
            self.config.clone(),
            ActorMetrics::new(),
        )
    }
}
