//! Shared test fixtures and utilities for netgym crates.
//!
//! Provides a scripted spy transport, a mock simulator serving the wire
//! protocol over loopback TCP, canned decision points and deterministic RNG
//! setup.

pub mod fixtures;
pub mod mock;
pub mod rng;
pub mod spy;

// ---------------------------------------------------------------------------
// Re-exports for convenience
// ---------------------------------------------------------------------------

pub use fixtures::{decision, decision_reply, handshake};
pub use mock::{Faults, MockConfig, MockCounters, MockSimulator, SessionEnd, serve_connection};
pub use rng::{random_action_batch, random_decision_point, seeded_rng};
pub use spy::SpyTransport;
