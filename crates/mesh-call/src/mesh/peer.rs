//! `PeerChannel` - offer/answer/candidate sequencing for one remote device.
//!
//! ```text
//! Fresh ──create_offer──▶ OfferCreated ──accept_answer──▶ Connecting ──▶ Connected
//!   └────accept_offer──▶ AnswerPending ──(answer sent)──▶ Connecting
//!
//! Connected ──create_offer / accept_offer──▶ (renegotiation) ──▶ Connected
//! any ──hangup──▶ Ended
//! ```
//!
//! SDP steps are only issued when the current state allows them and the media
//! engine reports the connection ready. Anything else is rejected locally and
//! nothing is sent.

use crate::actors::messages::PeerInfo;
use crate::errors::CallError;
use crate::media::{ConnectionHandle, ConnectionState, MediaTransport};
use crate::signaling::{IceCandidate, SessionDescription, SignalingPayload};
use common::types::{ParticipantId, SessionId};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Signaling state of one peer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Fresh,
    OfferCreated,
    AnswerPending,
    Connecting,
    Connected,
    Ended,
}

impl SignalingState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalingState::Fresh => "fresh",
            SignalingState::OfferCreated => "offer_created",
            SignalingState::AnswerPending => "answer_pending",
            SignalingState::Connecting => "connecting",
            SignalingState::Connected => "connected",
            SignalingState::Ended => "ended",
        }
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: SignalingState) -> bool {
        use SignalingState::{AnswerPending, Connected, Connecting, Ended, Fresh, OfferCreated};
        matches!(
            (self, next),
            (Fresh, OfferCreated | AnswerPending | Ended)
                | (OfferCreated, Connecting | Connected | Ended)
                | (AnswerPending, Connecting | Connected | Ended)
                | (Connecting, Connected | AnswerPending | Ended)
                | (Connected, OfferCreated | AnswerPending | Ended)
        )
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side sent the first offer on this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

/// One media connection to one remote device.
#[derive(Debug)]
pub struct PeerChannel {
    remote: ParticipantId,
    remote_session: SessionId,
    handle: ConnectionHandle,
    role: PeerRole,
    state: SignalingState,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    renegotiating: bool,
    remote_audio_muted: bool,
    remote_video_muted: bool,
    /// Stops the task forwarding this connection's events.
    events_token: CancellationToken,
}

impl PeerChannel {
    #[must_use]
    pub fn new(
        remote: ParticipantId,
        remote_session: SessionId,
        handle: ConnectionHandle,
        role: PeerRole,
        events_token: CancellationToken,
    ) -> Self {
        Self {
            remote,
            remote_session,
            handle,
            role,
            state: SignalingState::Fresh,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            renegotiating: false,
            remote_audio_muted: false,
            remote_video_muted: false,
            events_token,
        }
    }

    #[must_use]
    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    #[must_use]
    pub fn remote_session(&self) -> &SessionId {
        &self.remote_session
    }

    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    #[must_use]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    #[must_use]
    pub fn state(&self) -> SignalingState {
        self.state
    }

    #[must_use]
    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Offer sent and not yet answered.
    #[must_use]
    pub fn has_outstanding_offer(&self) -> bool {
        self.state == SignalingState::OfferCreated
    }

    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            remote: self.remote.clone(),
            remote_session: self.remote_session.clone(),
            connection: self.handle,
            role: self.role,
            state: self.state,
            queued_candidates: self.pending_candidates.len(),
            remote_audio_muted: self.remote_audio_muted,
            remote_video_muted: self.remote_video_muted,
        }
    }

    fn transition(&mut self, next: SignalingState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                target: "call.peer",
                remote = %self.remote,
                from = %self.state,
                to = %next,
                "Invalid signaling transition"
            );
            return false;
        }
        debug!(
            target: "call.peer",
            remote = %self.remote,
            from = %self.state,
            to = %next,
            "Signaling state changed"
        );
        self.state = next;
        true
    }

    fn media_ready(&self, media: &dyn MediaTransport, step: &'static str) -> bool {
        if media.is_ready(self.handle) {
            return true;
        }
        warn!(
            target: "call.peer",
            remote = %self.remote,
            connection = %self.handle,
            step,
            "Media not ready, rejecting signaling step"
        );
        false
    }

    /// Create and apply a local offer. Valid from `Fresh`, or from `Connected`
    /// to renegotiate. Returns `None` if rejected locally.
    pub async fn create_offer(
        &mut self,
        media: &dyn MediaTransport,
    ) -> Result<Option<SignalingPayload>, CallError> {
        if !matches!(
            self.state,
            SignalingState::Fresh | SignalingState::Connected
        ) {
            warn!(
                target: "call.peer",
                remote = %self.remote,
                state = %self.state,
                "Cannot create offer in current state"
            );
            return Ok(None);
        }
        if !self.media_ready(media, "create_offer") {
            return Ok(None);
        }

        let offer = media.create_offer(self.handle).await?;
        media.set_local_description(self.handle, &offer).await?;

        self.renegotiating = self.state == SignalingState::Connected;
        self.transition(SignalingState::OfferCreated);

        Ok(Some(SignalingPayload::Offer { sdp: offer.sdp }))
    }

    /// Apply a remote offer and produce the answer.
    ///
    /// Valid from `Fresh`, `Connecting` and `Connected`. An offer while our
    /// own offer is outstanding is glare and must be resolved by the caller.
    pub async fn accept_offer(
        &mut self,
        media: &dyn MediaTransport,
        sdp: &str,
    ) -> Result<Option<SignalingPayload>, CallError> {
        if !matches!(
            self.state,
            SignalingState::Fresh | SignalingState::Connecting | SignalingState::Connected
        ) {
            warn!(
                target: "call.peer",
                remote = %self.remote,
                state = %self.state,
                "Cannot accept offer in current state"
            );
            return Ok(None);
        }
        if !self.media_ready(media, "accept_offer") {
            return Ok(None);
        }

        self.renegotiating = self.state == SignalingState::Connected;
        self.transition(SignalingState::AnswerPending);

        media
            .set_remote_description(self.handle, &SessionDescription::offer(sdp))
            .await?;
        self.remote_description_set = true;

        let answer = media.create_answer(self.handle).await?;
        media.set_local_description(self.handle, &answer).await?;

        self.finish_exchange();
        self.flush_candidates(media).await;

        Ok(Some(SignalingPayload::Answer { sdp: answer.sdp }))
    }

    /// Apply the remote answer to our outstanding offer. Returns `false` if
    /// rejected locally.
    pub async fn accept_answer(
        &mut self,
        media: &dyn MediaTransport,
        sdp: &str,
    ) -> Result<bool, CallError> {
        if self.state != SignalingState::OfferCreated {
            warn!(
                target: "call.peer",
                remote = %self.remote,
                state = %self.state,
                "Unexpected answer, no offer outstanding"
            );
            return Ok(false);
        }
        if !self.media_ready(media, "accept_answer") {
            return Ok(false);
        }

        media
            .set_remote_description(self.handle, &SessionDescription::answer(sdp))
            .await?;
        self.remote_description_set = true;

        self.finish_exchange();
        self.flush_candidates(media).await;

        Ok(true)
    }

    fn finish_exchange(&mut self) {
        let next = if self.renegotiating {
            SignalingState::Connected
        } else {
            SignalingState::Connecting
        };
        self.renegotiating = false;
        self.transition(next);
    }

    /// Apply remote candidates, queueing them until the remote description is
    /// set and media is ready.
    pub async fn add_remote_candidates(
        &mut self,
        media: &dyn MediaTransport,
        candidates: Vec<IceCandidate>,
    ) {
        if self.state == SignalingState::Ended {
            debug!(
                target: "call.peer",
                remote = %self.remote,
                count = candidates.len(),
                "Dropping candidates for ended channel"
            );
            return;
        }
        // Appended behind anything already queued so candidates apply in arrival order.
        self.pending_candidates.extend(candidates);
        if !self.remote_description_set || !media.is_ready(self.handle) {
            debug!(
                target: "call.peer",
                remote = %self.remote,
                queued = self.pending_candidates.len(),
                "Queued remote candidates"
            );
            return;
        }
        self.flush_candidates(media).await;
    }

    /// Apply every queued candidate if the remote description is set and media
    /// is ready.
    pub async fn flush_candidates(&mut self, media: &dyn MediaTransport) {
        if self.pending_candidates.is_empty()
            || !self.remote_description_set
            || !media.is_ready(self.handle)
        {
            return;
        }
        // Candidates arriving while flushing go to the fresh queue.
        let queued = std::mem::take(&mut self.pending_candidates);
        debug!(
            target: "call.peer",
            remote = %self.remote,
            count = queued.len(),
            "Flushing queued candidates"
        );
        self.apply_candidates(media, queued).await;
    }

    async fn apply_candidates(&self, media: &dyn MediaTransport, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = media.add_remote_candidate(self.handle, &candidate).await {
                warn!(
                    target: "call.peer",
                    remote = %self.remote,
                    error = %e,
                    "Failed to add remote candidate"
                );
            }
        }
    }

    /// Track the media engine's view of the connection.
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        if state == ConnectionState::Connected && self.state == SignalingState::Connecting {
            self.transition(SignalingState::Connected);
        }
    }

    pub fn set_remote_metadata(&mut self, audio_muted: bool, video_muted: bool) {
        self.remote_audio_muted = audio_muted;
        self.remote_video_muted = video_muted;
    }

    /// End the channel and close its connection. Idempotent.
    pub async fn hangup(&mut self, media: &dyn MediaTransport) {
        if self.state == SignalingState::Ended {
            return;
        }
        self.transition(SignalingState::Ended);
        self.events_token.cancel();
        self.pending_candidates.clear();
        media.close_connection(self.handle).await;
    }
}
