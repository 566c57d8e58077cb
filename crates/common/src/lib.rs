//! Common types shared across the mesh call coordinator crates.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;
