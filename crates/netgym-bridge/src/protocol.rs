//! Wire messages exchanged with the simulator.
//!
//! The bridge is a strict request/response client:
//!
//! 1. Bridge sends a [`Request`] (`reset`, `step` or `shutdown`)
//! 2. Simulator answers `reset` and `step` with exactly one [`Reply`]
//!
//! Every decision point is tagged with the episode it belongs to and its
//! sequence number inside that episode, so replies that arrive late (after a
//! timeout or a reset) can be told apart from the one being waited for.
//!
//! Messages are JSON objects carried in length-prefixed frames, see
//! [`framing`](crate::framing).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use netgym_core::spaces::Handshake;
use netgym_core::types::{ActionBatch, EntityObservation, Info};

/// Wire protocol version, reported by `netgym info`.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Largest accepted frame payload (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the little-endian `u32` length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request from the bridge to the simulator.
///
/// # Example
///
/// ```
/// use netgym_bridge::protocol::Request;
///
/// let json = r#"{"type":"reset","episode":3,"seed":42}"#;
/// let req: Request = serde_json::from_str(json).unwrap();
/// assert!(matches!(req, Request::Reset { episode: 3, seed: Some(42), .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Start episode `episode`, discarding whatever ran before.
    Reset {
        episode: u64,
        #[serde(default)]
        seed: Option<u64>,
        #[serde(default)]
        run_id: Option<String>,
    },
    /// Answer decision point `seq` of `episode` with one action per entity.
    Step {
        episode: u64,
        seq: u64,
        actions: ActionBatch,
    },
    /// The bridge is going away. No reply is expected.
    Shutdown,
}

impl Request {
    /// Message type name (matches the serde tag).
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Reset { .. } => "reset",
            Self::Step { .. } => "step",
            Self::Shutdown => "shutdown",
        }
    }
}

// ---------------------------------------------------------------------------
// DecisionPoint
// ---------------------------------------------------------------------------

/// A moment at which the simulator pauses and asks for actions.
///
/// `observation` and `reward` hold one entry per entity. The first decision
/// point of every episode (`seq == 0`) carries the [`Handshake`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub episode: u64,
    pub seq: u64,
    pub observation: Vec<EntityObservation>,
    pub reward: Vec<f64>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub info: Info,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<Handshake>,
}

impl DecisionPoint {
    /// Number of entities present at this decision point.
    pub const fn entity_count(&self) -> usize {
        self.observation.len()
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// A message from the simulator to the bridge.
///
/// # Example
///
/// ```
/// use netgym_bridge::protocol::Reply;
///
/// let json = r#"{"type":"error","message":"unknown scenario"}"#;
/// let reply: Reply = serde_json::from_str(json).unwrap();
/// assert!(matches!(reply, Reply::Error { .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// The simulator needs actions.
    Decision(DecisionPoint),
    /// The simulator rejected the last request (e.g. a failed handshake).
    Error { message: String },
}

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// Framing and payload errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("{trailing} unexpected bytes after frame")]
    TrailingBytes { trailing: usize },

    #[error("Invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
