//! # Call Test Utilities
//!
//! Shared test utilities for the mesh call coordinator.
//!
//! This crate provides mock implementations of the injected capabilities and
//! test fixtures, so sessions can be driven without a real room transport or
//! media engine.
//!
//! ## Modules
//!
//! - `mock_store` - In-memory announcement store with subscriber echo
//! - `mock_media` - Media engine mock with scriptable connection events
//! - `mock_sender` - Recording to-device and reaction sender
//! - `fixtures` - Identities, descriptor, announcement and envelope builders
//! - `harness` - `TestCall`, wiring the mocks into a session or registry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let test = TestCall::new(alice());
//!     test.store.announce(TestAnnouncement::new(bob()).build());
//!
//!     let (session, _task) = test.spawn();
//!     session.enter().await.unwrap();
//!
//!     assert_eq!(test.sender.count_to(&bob(), "offer"), 1);
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_media;
pub mod mock_sender;
pub mod mock_store;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
pub use mock_media::*;
pub use mock_sender::*;
pub use mock_store::*;
