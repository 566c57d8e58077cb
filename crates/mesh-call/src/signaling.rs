//! To-device signaling payloads and the event sender contract.
//!
//! Offers, answers, candidates, metadata and hangups travel as to-device
//! messages addressed to one remote device. Reactions are room events.

use crate::errors::CallError;
use common::types::{CallId, ParticipantId, RoomId, SessionId};
use serde::{Deserialize, Serialize};

/// Which half of an offer/answer exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP blob tagged with its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Why a peer connection was hung up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    /// Local side left the call or the remote departed.
    UserHangup,
    /// Connectivity failed.
    IceFailed,
    /// Superseded by a newer connection to the same device.
    Replaced,
}

/// Signaling message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidates { candidates: Vec<IceCandidate> },
    MetadataChanged { audio_muted: bool, video_muted: bool },
    Hangup { reason: HangupReason },
}

impl SignalingPayload {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalingPayload::Offer { .. } => "offer",
            SignalingPayload::Answer { .. } => "answer",
            SignalingPayload::Candidates { .. } => "candidates",
            SignalingPayload::MetadataChanged { .. } => "metadata",
            SignalingPayload::Hangup { .. } => "hangup",
        }
    }
}

/// Addressed signaling message, used for both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub room_id: RoomId,
    pub call_id: CallId,
    pub sender: ParticipantId,
    pub sender_session_id: SessionId,
    pub payload: SignalingPayload,
}

/// A reaction sent into the room while in a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub call_id: CallId,
    pub sender: ParticipantId,
    /// Emoji or short key.
    pub key: String,
    /// Ephemeral reactions are not persisted and are rate limited.
    pub ephemeral: bool,
}

/// Outbound event transport.
#[async_trait::async_trait]
pub trait EventSender: Send + Sync {
    /// Send a signaling message to one remote device.
    async fn send_to_device(
        &self,
        target: &ParticipantId,
        envelope: &SignalingEnvelope,
    ) -> Result<(), CallError>;

    /// Send a reaction into the room. Returns the event id.
    async fn send_reaction(&self, room_id: &RoomId, reaction: &Reaction)
        -> Result<String, CallError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_format_is_tagged() {
        let payload = SignalingPayload::Hangup {
            reason: HangupReason::IceFailed,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "hangup");
        assert_eq!(json["reason"], "ice_failed");

        let parsed: SignalingPayload =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0"}"#).unwrap();
        assert_eq!(
            parsed,
            SignalingPayload::Offer {
                sdp: "v=0".to_string()
            }
        );
    }

    #[test]
    fn test_candidate_optional_fields_omitted() {
        let json = serde_json::to_string(&IceCandidate::new("candidate:1 1 udp")).unwrap();
        assert!(!json.contains("sdp_mid"));

        let parsed: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).unwrap();
        assert_eq!(parsed.sdp_m_line_index, None);
    }

    #[test]
    fn test_payload_kind_labels() {
        assert_eq!(
            SignalingPayload::Candidates { candidates: vec![] }.kind(),
            "candidates"
        );
        assert_eq!(
            SignalingPayload::MetadataChanged {
                audio_muted: true,
                video_muted: false
            }
            .kind(),
            "metadata"
        );
    }
}
