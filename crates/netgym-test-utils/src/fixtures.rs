//! Ready-made handshakes and decision points.

use netgym_bridge::protocol::{DecisionPoint, Reply};
use netgym_core::types::{EntityObservation, Info};

pub use netgym_bridge::mock_sim::{OBS_HIGH, handshake};

/// Decision point `seq` of `episode` with `entities` entities observing
/// `obs_dim` values each. Observation value is `seq + entity / 10`; reward
/// is `1.0` for every entity. `seq == 0` carries a 4-action handshake.
pub fn decision(episode: u64, seq: u64, entities: usize, obs_dim: usize, done: bool) -> DecisionPoint {
    #[allow(clippy::cast_precision_loss)]
    let observation = (0..entities)
        .map(|entity| EntityObservation::new(vec![seq as f64 + entity as f64 / 10.0; obs_dim]))
        .collect();
    DecisionPoint {
        episode,
        seq,
        observation,
        reward: vec![1.0; entities],
        done,
        info: Info::new(),
        handshake: (seq == 0).then(|| handshake(entities, obs_dim, 4)),
    }
}

/// [`decision`] wrapped in a [`Reply`].
pub fn decision_reply(episode: u64, seq: u64, entities: usize, obs_dim: usize, done: bool) -> Reply {
    Reply::Decision(decision(episode, seq, entities, obs_dim, done))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
