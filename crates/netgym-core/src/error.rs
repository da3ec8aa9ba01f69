use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Incompatible configuration: {0}")]
    Incompatible(String),
}

/// Space derivation errors.
///
/// Raised when the simulator's handshake payload is internally inconsistent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpaceError {
    #[error("First decision point of the episode carries no handshake")]
    MissingHandshake,

    #[error("Entity count mismatch: {what} has {got} entries, expected {expected}")]
    EntityCountMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Mismatched low/high dimensions for entity {entity}: low={low}, high={high}")]
    DimensionMismatch { entity: usize, low: usize, high: usize },

    #[error("Invalid bounds for entity {entity} at dimension {dim}: low={low}, high={high}")]
    InvalidBounds {
        entity: usize,
        dim: usize,
        low: f64,
        high: f64,
    },

    #[error("Discrete space for entity {entity} has zero cardinality")]
    EmptyDiscrete { entity: usize },

    #[error("Observation of entity {entity} has {got} values, space declares {expected}")]
    ObservationDimMismatch {
        entity: usize,
        expected: usize,
        got: usize,
    },
}

/// Action batch validation errors.
///
/// Copy + static messages for cheap propagation in hot paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Entity count mismatch: expected {expected} actions, got {got}")]
    EntityCountMismatch { expected: usize, got: usize },

    #[error("Action kind mismatch for entity {entity}: space is {expected}")]
    KindMismatch {
        entity: usize,
        expected: &'static str,
    },

    #[error("Action dimension mismatch for entity {entity}: expected {expected}, got {got}")]
    ActionDimMismatch {
        entity: usize,
        expected: usize,
        got: usize,
    },

    #[error("Action for entity {entity} contains NaN")]
    ActionContainsNan { entity: usize },

    #[error("Action for entity {entity} contains Inf")]
    ActionContainsInf { entity: usize },

    #[error("Action for entity {entity} out of bounds at dimension {dim}")]
    ActionOutOfBounds { entity: usize, dim: usize },

    #[error("Discrete action for entity {entity} out of range: {value} >= {max}")]
    DiscreteOutOfRange { entity: usize, value: u64, max: u64 },
}
