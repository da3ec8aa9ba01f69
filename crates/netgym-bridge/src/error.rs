//! Error taxonomy surfaced to RL code.
//!
//! Every failure an agent can see is one [`BridgeError`] variant. Lower-level
//! errors ([`CodecError`], [`TransportError`], [`SupervisorError`]) are folded
//! into it at the module boundaries.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use netgym_core::error::{ConfigError, SpaceError, ValidationError};

use crate::protocol::CodecError;
use crate::state_machine::EpisodeState;
use crate::supervisor::SupervisorError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to launch simulator {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Simulator failed to start: {reason}{}", diagnostics_suffix(.diagnostics))]
    SimulatorStartupFailure { reason: String, diagnostics: String },

    #[error("Failed to connect to simulator at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Simulator disconnected while {state}: {detail}{}", diagnostics_suffix(.diagnostics))]
    SimulatorDisconnected {
        state: EpisodeState,
        detail: String,
        diagnostics: String,
    },

    #[error("No decision point within {waited:?} (state {state})")]
    Timeout { waited: Duration, state: EpisodeState },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid space descriptor: {0}")]
    InvalidSpaceDescriptor(#[from] SpaceError),

    #[error("Action shape mismatch: {0}")]
    ActionShapeMismatch(#[from] ValidationError),

    #[error("Illegal call to {operation} in state {state}: {reason}")]
    IllegalCallSequence {
        operation: &'static str,
        state: EpisodeState,
        reason: String,
    },

    #[error("Simulator reported an error: {message}")]
    Simulator { message: String },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Whether the same call may simply be retried.
    ///
    /// Only timeouts qualify: the request is still in flight and the episode
    /// state is unchanged.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the error was caused by the caller and left the session intact.
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalCallSequence { .. } | Self::ActionShapeMismatch(_) | Self::Config(_)
        )
    }

    pub(crate) fn illegal(operation: &'static str, state: EpisodeState, reason: impl Into<String>) -> Self {
        Self::IllegalCallSequence {
            operation,
            state,
            reason: reason.into(),
        }
    }

    /// Attach captured simulator output to errors that carry diagnostics.
    #[must_use]
    pub fn with_diagnostics(mut self, captured: String) -> Self {
        match &mut self {
            Self::SimulatorStartupFailure { diagnostics, .. }
            | Self::SimulatorDisconnected { diagnostics, .. }
                if diagnostics.is_empty() =>
            {
                *diagnostics = captured;
            }
            _ => {}
        }
        self
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}

impl From<SupervisorError> for BridgeError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Spawn { program, source } => Self::Spawn { program, source },
            SupervisorError::StartupFailed {
                reason,
                diagnostics,
            } => Self::SimulatorStartupFailure {
                reason,
                diagnostics,
            },
        }
    }
}

fn diagnostics_suffix(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!("\n--- simulator output ---\n{diagnostics}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
