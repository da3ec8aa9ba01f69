// netgym-core: Entity types, spaces, config and errors shared by the netgym bridge.

pub mod config;
pub mod error;
pub mod spaces;
pub mod types;

pub mod prelude {
    pub use crate::{
        config::BridgeConfig,
        error::{ConfigError, SpaceError, ValidationError},
        spaces::{Handshake, Space, SpaceDescriptor, VectorSpace},
        types::{ActionBatch, EntityAction, EntityObservation, Info, StepOutcome},
    };
}
