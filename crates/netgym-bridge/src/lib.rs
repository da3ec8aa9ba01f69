//! Step-based bridge between reinforcement learning code and an external
//! discrete-event network simulator.
//!
//! The simulator runs as its own process and pauses whenever a simulated
//! entity needs a decision. This crate turns that stream of decision points
//! into a synchronous, episodic `reset`/`step` interface:
//!
//! - [`protocol`] - wire messages ([`Request`], [`Reply`], [`DecisionPoint`])
//! - [`framing`] - length-prefixed JSON wire format (4-byte LE `u32` + payload)
//! - [`transport`] - [`Transport`] trait and the [`TcpChannel`] implementation
//! - [`supervisor`] - launching, readiness detection and teardown of the
//!   simulator process
//! - [`state_machine`] - [`EpisodeStateMachine`] enforcing `reset`/`step`
//!   ordering and exactly-once consumption of decision points
//! - [`handle`] - one process plus its channel, acquired and released together
//! - [`env`](mod@env) - [`NetGymEnv`], the agent-facing facade
//! - [`registry`] - named configurations, `make("id")` style
//! - `mock_sim` - scripted simulator serving the wire protocol (feature
//!   `mock-sim`)

pub mod env;
pub mod error;
pub mod framing;
pub mod handle;
#[cfg(feature = "mock-sim")]
pub mod mock_sim;
pub mod protocol;
pub mod registry;
pub mod state_machine;
pub mod supervisor;
pub mod transport;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use env::{CancelHandle, NetGymEnv};
pub use error::BridgeError;
pub use protocol::{DecisionPoint, PROTOCOL_VERSION, Reply, Request};
pub use registry::{Registry, RegistryError};
pub use state_machine::{EpisodeState, EpisodeStateMachine};
pub use transport::{TcpChannel, Transport, TransportError};

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        BridgeError, CancelHandle, EpisodeState, NetGymEnv, Registry,
        protocol::{DecisionPoint, PROTOCOL_VERSION, Reply, Request},
    };
    pub use netgym_core::prelude::*;
}
