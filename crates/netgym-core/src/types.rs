use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Diagnostic key/value map attached to a decision point.
///
/// Ordered so that encoding the same value always yields the same bytes.
pub type Info = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// EntityObservation
// ---------------------------------------------------------------------------

/// Observation vector of a single simulated entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityObservation {
    data: Vec<f64>,
}

impl EntityObservation {
    pub const fn new(data: Vec<f64>) -> Self {
        Self { data }
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    pub const fn len(&self) -> usize {
        self.data.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }
}

impl std::ops::Index<usize> for EntityObservation {
    type Output = f64;
    fn index(&self, i: usize) -> &f64 {
        &self.data[i]
    }
}

impl From<Vec<f64>> for EntityObservation {
    fn from(data: Vec<f64>) -> Self {
        Self::new(data)
    }
}

// ---------------------------------------------------------------------------
// EntityAction
// ---------------------------------------------------------------------------

/// Action for a single simulated entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    /// Continuous control values, one per dimension of the entity's box space.
    Continuous(Vec<f64>),
    /// Single discrete choice in [0, n).
    Discrete(u64),
}

impl EntityAction {
    /// Continuous action filled with zeros.
    pub fn zeros(len: usize) -> Self {
        Self::Continuous(vec![0.0; len])
    }

    /// Number of scalar elements.
    pub const fn len(&self) -> usize {
        match self {
            Self::Continuous(v) => v.len(),
            Self::Discrete(_) => 1,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short name of the variant, used in validation errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Continuous(_) => "continuous",
            Self::Discrete(_) => "discrete",
        }
    }
}

// ---------------------------------------------------------------------------
// ActionBatch
// ---------------------------------------------------------------------------

/// Ordered actions, one per entity, answering one decision point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionBatch {
    actions: Vec<EntityAction>,
}

impl ActionBatch {
    pub const fn new(actions: Vec<EntityAction>) -> Self {
        Self { actions }
    }

    /// Batch of discrete actions, one per entity.
    pub fn discrete(values: impl IntoIterator<Item = u64>) -> Self {
        Self::new(values.into_iter().map(EntityAction::Discrete).collect())
    }

    /// Number of entities addressed by this batch.
    pub const fn len(&self) -> usize {
        self.actions.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn as_slice(&self) -> &[EntityAction] {
        &self.actions
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntityAction> {
        self.actions.iter()
    }
}

impl From<Vec<EntityAction>> for ActionBatch {
    fn from(actions: Vec<EntityAction>) -> Self {
        Self::new(actions)
    }
}

impl FromIterator<EntityAction> for ActionBatch {
    fn from_iter<I: IntoIterator<Item = EntityAction>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Result of `env.step(actions)`.
///
/// `reward` holds one scalar per entity present at the decision point; no
/// aggregation is performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub observation: Vec<EntityObservation>,
    pub reward: Vec<f64>,
    /// No further decision point follows in this episode.
    pub done: bool,
    pub info: Info,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
