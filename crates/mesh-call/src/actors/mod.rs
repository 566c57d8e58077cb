//! Actor model implementation for the call coordinator.
//!
//! ```text
//! CallRegistryActor (singleton per process)
//! ├── owns the CircuitBreakerBoard shared by all sessions
//! └── supervises N GroupCallActors
//!     └── GroupCallActor (one per (room, call))
//!         ├── owns lifecycle state, participants, timers
//!         └── owns one MeshCoordinator
//! ```
//!
//! # Key Design Decisions
//!
//! - **One session per call**: a second `create_session` for the same `(room, call)` is a conflict
//! - **CancellationToken propagation**: the registry passes child tokens; a cancelled session
//!   leaves its call
//! - **Leave token**: leave requests are visible to an in-progress reconciliation before they
//!   are queued
//! - **Mailbox monitoring**: Depth thresholds with metrics (Registry: 100/500, Session: 50/200)
//! - **Message passing**: All inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`registry`] - `CallRegistryActor` singleton that supervises sessions
//! - [`session`] - `GroupCallActor` per call, owns call state
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod session;

// Re-export primary types
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{CallRegistryActor, CallRegistryHandle};
pub use session::{CallCapabilities, GroupCallActor, GroupCallHandle};
