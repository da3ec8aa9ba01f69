//! Deterministic RNG utilities for reproducible tests.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use netgym_bridge::protocol::DecisionPoint;
use netgym_core::spaces::{Handshake, Space};
use netgym_core::types::{ActionBatch, EntityAction, EntityObservation, Info};

/// Create a deterministic `ChaCha8Rng` from a seed.
///
/// All test randomization should go through this to ensure reproducibility.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Random handshake for `entities` entities: a mix of discrete and box
/// action spaces, box observation spaces of 0..=6 dimensions.
pub fn random_handshake(rng: &mut impl Rng, entities: usize) -> Handshake {
    let action_space = (0..entities)
        .map(|_| {
            if rng.gen_bool(0.5) {
                Space::Discrete {
                    n: rng.gen_range(1..=16),
                }
            } else {
                let dim = rng.gen_range(1..=4);
                Space::Box {
                    low: vec![-1.0; dim],
                    high: vec![1.0; dim],
                }
            }
        })
        .collect();
    let observation_space = (0..entities)
        .map(|_| {
            let dim = rng.gen_range(0..=6);
            Space::Box {
                low: vec![-10.0; dim],
                high: vec![10.0; dim],
            }
        })
        .collect();
    Handshake {
        action_space,
        observation_space,
    }
}

/// Random first decision point for `entities` entities, consistent with
/// its own handshake.
pub fn random_decision_point(rng: &mut impl Rng, episode: u64, entities: usize) -> DecisionPoint {
    let handshake = random_handshake(rng, entities);
    let observation = handshake
        .observation_space
        .iter()
        .map(|space| EntityObservation::new((0..space.dim()).map(|_| rng.gen_range(-10.0..=10.0)).collect()))
        .collect();
    let reward = (0..entities).map(|_| rng.gen_range(-5.0..5.0)).collect();
    let mut info = Info::new();
    info.insert("sim_time".into(), serde_json::json!(rng.gen_range(0.0..100.0)));
    DecisionPoint {
        episode,
        seq: 0,
        observation,
        reward,
        done: rng.gen_bool(0.1),
        info,
        handshake: Some(handshake),
    }
}

/// Random batch of `entities` actions, not necessarily valid for any space.
pub fn random_action_batch(rng: &mut impl Rng, entities: usize) -> ActionBatch {
    (0..entities)
        .map(|_| {
            if rng.gen_bool(0.5) {
                EntityAction::Discrete(rng.r#gen())
            } else {
                let dim = rng.gen_range(0..=4);
                EntityAction::Continuous((0..dim).map(|_| rng.gen_range(-1.0..=1.0)).collect())
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use netgym_core::spaces::SpaceDescriptor;

    use super::*;

    #[test]
    fn seeded_rng_is_deterministic() {
        let mut rng1 = seeded_rng(42);
        let mut rng2 = seeded_rng(42);
        let v1: u64 = rng1.r#gen();
        let v2: u64 = rng2.r#gen();
        assert_eq!(v1, v2);
    }

    #[test]
    fn random_decision_point_is_self_consistent() {
        let mut rng = seeded_rng(7);
        for entities in 0..=8 {
            let dp = random_decision_point(&mut rng, 1, entities);
            assert_eq!(dp.entity_count(), entities);
            SpaceDescriptor::derive(dp.handshake.as_ref(), &dp.observation, &dp.reward).unwrap();
        }
    }

    #[test]
    fn same_seed_same_point() {
        let a = random_decision_point(&mut seeded_rng(3), 1, 4);
        let b = random_decision_point(&mut seeded_rng(3), 1, 4);
        assert_eq!(a, b);
    }
}
