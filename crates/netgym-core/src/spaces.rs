//! Per-entity action and observation spaces.
//!
//! The simulator, not the bridge, decides how many entities take part in an
//! episode and which ranges their actions may take. Both are announced in the
//! [`Handshake`] carried by the first decision point of every episode, from
//! which a [`SpaceDescriptor`] is derived. The descriptor is then used to
//! validate every [`ActionBatch`] before it leaves the process, and every
//! later decision point of the episode as it arrives.

use serde::{Deserialize, Serialize};

use crate::error::{SpaceError, ValidationError};
use crate::types::{ActionBatch, EntityAction, EntityObservation};

// ---------------------------------------------------------------------------
// Space
// ---------------------------------------------------------------------------

/// Shape and bounds of one entity's actions or observations.
///
/// Follows Gymnasium conventions for the two variants the simulator declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Space {
    /// Continuous values with inclusive per-dimension bounds.
    Box { low: Vec<f64>, high: Vec<f64> },
    /// A single choice in `[0, n)`.
    Discrete { n: u64 },
}

impl Space {
    /// Number of scalar values an entity exchanges in this space.
    pub const fn dim(&self) -> usize {
        match self {
            Self::Box { low, .. } => low.len(),
            Self::Discrete { .. } => 1,
        }
    }

    /// Short name of the variant, used in validation errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Box { .. } => "box",
            Self::Discrete { .. } => "discrete",
        }
    }

    /// Check that the space itself is well-formed.
    ///
    /// Bounds may be infinite but never NaN, and `low <= high` everywhere.
    pub fn validate(&self, entity: usize) -> Result<(), SpaceError> {
        match self {
            Self::Box { low, high } => {
                if low.len() != high.len() {
                    return Err(SpaceError::DimensionMismatch {
                        entity,
                        low: low.len(),
                        high: high.len(),
                    });
                }
                for (dim, (l, h)) in low.iter().zip(high).enumerate() {
                    if l.is_nan() || h.is_nan() || l > h {
                        return Err(SpaceError::InvalidBounds {
                            entity,
                            dim,
                            low: *l,
                            high: *h,
                        });
                    }
                }
                Ok(())
            }
            Self::Discrete { n } if *n == 0 => Err(SpaceError::EmptyDiscrete { entity }),
            Self::Discrete { .. } => Ok(()),
        }
    }

    /// Validate one entity's action against this space.
    pub fn check_action(&self, entity: usize, action: &EntityAction) -> Result<(), ValidationError> {
        match (self, action) {
            (Self::Box { low, high }, EntityAction::Continuous(values)) => {
                if values.len() != low.len() {
                    return Err(ValidationError::ActionDimMismatch {
                        entity,
                        expected: low.len(),
                        got: values.len(),
                    });
                }
                for (dim, (v, (l, h))) in values.iter().zip(low.iter().zip(high)).enumerate() {
                    if v.is_nan() {
                        return Err(ValidationError::ActionContainsNan { entity });
                    }
                    if v.is_infinite() {
                        return Err(ValidationError::ActionContainsInf { entity });
                    }
                    if v < l || v > h {
                        return Err(ValidationError::ActionOutOfBounds { entity, dim });
                    }
                }
                Ok(())
            }
            (Self::Discrete { n }, EntityAction::Discrete(value)) => {
                if value < n {
                    Ok(())
                } else {
                    Err(ValidationError::DiscreteOutOfRange {
                        entity,
                        value: *value,
                        max: *n,
                    })
                }
            }
            _ => Err(ValidationError::KindMismatch {
                entity,
                expected: self.kind(),
            }),
        }
    }

    /// Sample a random action. Takes `&mut impl Rng` for determinism.
    ///
    /// Unbounded box dimensions sample the finite end of the range, or zero
    /// when both ends are open.
    pub fn sample(&self, rng: &mut impl rand::Rng) -> EntityAction {
        match self {
            Self::Box { low, high } => EntityAction::Continuous(
                low.iter()
                    .zip(high)
                    .map(|(&l, &h)| {
                        if !(l.is_finite() && h.is_finite()) {
                            0.0_f64.clamp(l, h)
                        } else if (h - l).is_finite() {
                            rng.gen_range(l..=h)
                        } else {
                            // Span overflows f64; step in halves.
                            let half = h / 2.0 - l / 2.0;
                            let u: f64 = rng.r#gen();
                            (l + half * u + half * u).clamp(l, h)
                        }
                    })
                    .collect(),
            ),
            Self::Discrete { n } => EntityAction::Discrete(rng.gen_range(0..*n)),
        }
    }
}

// ---------------------------------------------------------------------------
// VectorSpace
// ---------------------------------------------------------------------------

/// Ordered per-entity spaces; entry `i` describes entity `i`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorSpace {
    entities: Vec<Space>,
}

impl VectorSpace {
    pub const fn new(entities: Vec<Space>) -> Self {
        Self { entities }
    }

    /// Number of entities described.
    pub const fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> &[Space] {
        &self.entities
    }

    pub fn get(&self, entity: usize) -> Option<&Space> {
        self.entities.get(entity)
    }

    /// Per-entity dimensions, e.g. `[4, 4, 4]` for three 4-value boxes.
    pub fn shape(&self) -> Vec<usize> {
        self.entities.iter().map(Space::dim).collect()
    }

    /// Sample one action per entity.
    pub fn sample(&self, rng: &mut impl rand::Rng) -> ActionBatch {
        self.entities.iter().map(|space| space.sample(rng)).collect()
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Space declaration sent by the simulator with the first decision point of
/// each episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// One action space per entity.
    pub action_space: Vec<Space>,
    /// One observation space per entity.
    pub observation_space: Vec<Space>,
}

// ---------------------------------------------------------------------------
// SpaceDescriptor
// ---------------------------------------------------------------------------

/// Action and observation spaces negotiated for the current episode.
///
/// Derived once per episode; read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceDescriptor {
    action: VectorSpace,
    observation: VectorSpace,
}

impl SpaceDescriptor {
    /// Derive the descriptor from the first decision point of an episode.
    ///
    /// Fails if the handshake is missing or disagrees with the decision
    /// point it arrived with.
    pub fn derive(
        handshake: Option<&Handshake>,
        observation: &[EntityObservation],
        reward: &[f64],
    ) -> Result<Self, SpaceError> {
        let handshake = handshake.ok_or(SpaceError::MissingHandshake)?;
        let entities = handshake.action_space.len();

        if handshake.observation_space.len() != entities {
            return Err(SpaceError::EntityCountMismatch {
                what: "observation_space",
                expected: entities,
                got: handshake.observation_space.len(),
            });
        }
        for (entity, space) in handshake.action_space.iter().enumerate() {
            space.validate(entity)?;
        }
        for (entity, space) in handshake.observation_space.iter().enumerate() {
            space.validate(entity)?;
        }

        let descriptor = Self {
            action: VectorSpace::new(handshake.action_space.clone()),
            observation: VectorSpace::new(handshake.observation_space.clone()),
        };
        descriptor.check_decision(observation, reward)?;
        Ok(descriptor)
    }

    /// Check that a decision point matches the negotiated entity layout.
    pub fn check_decision(
        &self,
        observation: &[EntityObservation],
        reward: &[f64],
    ) -> Result<(), SpaceError> {
        let entities = self.entity_count();
        if observation.len() != entities {
            return Err(SpaceError::EntityCountMismatch {
                what: "observation",
                expected: entities,
                got: observation.len(),
            });
        }
        if reward.len() != entities {
            return Err(SpaceError::EntityCountMismatch {
                what: "reward",
                expected: entities,
                got: reward.len(),
            });
        }
        for (entity, (obs, space)) in observation.iter().zip(self.observation.entities()).enumerate() {
            if obs.len() != space.dim() {
                return Err(SpaceError::ObservationDimMismatch {
                    entity,
                    expected: space.dim(),
                    got: obs.len(),
                });
            }
        }
        Ok(())
    }

    /// Validate an action batch: entity count first, then each entity.
    pub fn validate(&self, actions: &ActionBatch) -> Result<(), ValidationError> {
        if actions.len() != self.entity_count() {
            return Err(ValidationError::EntityCountMismatch {
                expected: self.entity_count(),
                got: actions.len(),
            });
        }
        actions
            .iter()
            .zip(self.action.entities())
            .enumerate()
            .try_for_each(|(entity, (action, space))| space.check_action(entity, action))
    }

    pub const fn entity_count(&self) -> usize {
        self.action.entity_count()
    }

    pub const fn action_space(&self) -> &VectorSpace {
        &self.action
    }

    pub const fn observation_space(&self) -> &VectorSpace {
        &self.observation
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
