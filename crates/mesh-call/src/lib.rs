//! Mesh Call Coordinator Library
//!
//! This library coordinates a multi-party call whose membership and signaling
//! travel over a room's eventually-consistent state channel, while media flows
//! over a full mesh of pairwise peer connections:
//!
//! - Lifecycle of "being in a call" (enter, re-announce, leave, auto-leave)
//! - Membership reconciliation of TTL-bounded announcements into join/leave batches
//! - Deterministic initiator tie-break to avoid offer glare
//! - Per-peer circuit breaking so one broken device cannot destabilize the call
//! - Per-peer offer/answer/candidate sequencing
//!
//! # Architecture
//!
//! The coordinator uses an actor model hierarchy:
//!
//! ```text
//! CallRegistryActor (singleton per process)
//! ├── owns the shared CircuitBreakerBoard
//! └── supervises N GroupCallActors
//!     └── GroupCallActor (one per (room, call))
//!         ├── owns the participant set, timers and reaction budget
//!         └── owns one MeshCoordinator
//!             └── PeerChannel (one per remote device)
//! ```
//!
//! The media engine and the room transport are injected as capability traits
//! ([`media::MediaTransport`], [`announcement::AnnouncementStore`],
//! [`signaling::EventSender`]); nothing in this crate performs network or
//! media I/O itself.
//!
//! # Modules
//!
//! - [`actors`] - Registry and session actors, message types, mailbox metrics
//! - [`announcement`] - Membership announcements and the store contract
//! - [`config`] - Tunable timings and thresholds loaded from environment
//! - [`errors`] - Error taxonomy
//! - [`media`] - Media transport contract
//! - [`membership`] - Pure participant-set derivation and diffing
//! - [`mesh`] - Mesh coordinator, tie-break, circuit breaker, peer channels
//! - [`observability`] - Tracing setup and metrics
//! - [`reactions`] - Ephemeral reaction budget
//! - [`signaling`] - To-device signaling payloads and the sender contract

pub mod actors;
pub mod announcement;
pub mod config;
pub mod errors;
pub mod media;
pub mod membership;
pub mod mesh;
pub mod observability;
pub mod reactions;
pub mod signaling;

pub use common::types::{CallId, ParticipantId, RoomId, SessionId};
