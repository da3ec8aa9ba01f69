//! Integration test: `NetGymEnv` attached to a mock simulator over TCP.
//!
//! Covers the full request/response path including framing over a real
//! socket:
//! 1. Three entities, five steps, `done`, then `IllegalCallSequence`
//! 2. One decision point consumed per action batch sent
//! 3. Crash and stall faults, including a crash before the first decision
//!    point
//! 4. Cancellation from another thread

use std::thread;
use std::time::{Duration, Instant};

use netgym_bridge::{BridgeError, EpisodeState, NetGymEnv};
use netgym_core::config::BridgeConfig;
use netgym_core::types::ActionBatch;
use netgym_test_utils::{Faults, MockConfig, MockSimulator};

fn attach(mock: &MockSimulator) -> NetGymEnv {
    let mut config = BridgeConfig::attached(mock.address());
    config.step_timeout_secs = 2.0;
    NetGymEnv::new(config).unwrap()
}

#[test]
fn three_entities_five_steps() {
    let mock = MockSimulator::start(MockConfig::new(3, 5)).unwrap();
    let mut env = attach(&mock);

    let obs = env.reset().unwrap();
    assert_eq!(obs.len(), 3);
    assert_eq!(env.action_space().unwrap().entity_count(), 3);
    assert_eq!(env.observation_space().unwrap().shape(), vec![2, 2, 2]);

    let batch = ActionBatch::discrete([0, 1, 2]);
    for step in 1..=5 {
        let out = env.step(&batch).unwrap();
        assert_eq!(out.observation.len(), 3);
        assert_eq!(out.reward, vec![0.0, 1.0, 2.0]);
        assert_eq!(out.done, step == 5, "step {step}");
    }
    assert_eq!(env.state(), EpisodeState::Terminated);

    let err = env.step(&batch).unwrap_err();
    assert!(matches!(err, BridgeError::IllegalCallSequence { .. }));

    env.reset().unwrap();
    assert_eq!(env.state(), EpisodeState::AwaitingAction);
    env.close();
}

#[test]
fn batches_and_decisions_are_one_to_one() {
    let mock = MockSimulator::start(MockConfig::new(2, 4)).unwrap();
    let mut env = attach(&mock);

    for _ in 0..3 {
        env.reset().unwrap();
        loop {
            if env.step(&ActionBatch::discrete([1, 1])).unwrap().done {
                break;
            }
        }
    }
    env.close();

    let counters = mock.counters();
    assert_eq!(counters.resets(), 3);
    assert_eq!(counters.batches(), 12);
    assert_eq!(counters.batches(), env.batches_sent());
    assert_eq!(counters.decisions(), env.decisions_received());
    assert_eq!(counters.decisions(), counters.batches() + counters.resets());
}

#[test]
fn seed_is_base_plus_episode_index() {
    let mock = MockSimulator::start(MockConfig::new(1, 1)).unwrap();
    let mut config = BridgeConfig::attached(mock.address());
    config.seed = Some(100);
    let mut env = NetGymEnv::new(config).unwrap();

    env.reset().unwrap();
    let out = env.step(&ActionBatch::discrete([0])).unwrap();
    assert_eq!(out.info["seed"], 100);

    env.reset().unwrap();
    let out = env.step(&ActionBatch::discrete([0])).unwrap();
    assert_eq!(out.info["seed"], 101);
}

#[test]
fn duplicated_decisions_are_consumed_once() {
    let faults = Faults {
        duplicate_decisions: true,
        ..Faults::default()
    };
    let mock = MockSimulator::start(MockConfig::new(1, 3).with_faults(faults)).unwrap();
    let mut env = attach(&mock);

    env.reset().unwrap();
    for _ in 0..3 {
        env.step(&ActionBatch::discrete([0])).unwrap();
    }
    assert_eq!(env.state(), EpisodeState::Terminated);
    assert_eq!(env.decisions_received(), 4);
}

#[test]
fn crash_mid_episode_is_disconnect() {
    let faults = Faults {
        crash_after_steps: Some(2),
        ..Faults::default()
    };
    let mock = MockSimulator::start(MockConfig::new(2, 10).with_faults(faults)).unwrap();
    let mut env = attach(&mock);

    env.reset().unwrap();
    env.step(&ActionBatch::discrete([0, 0])).unwrap();
    let err = env.step(&ActionBatch::discrete([0, 0])).unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::SimulatorDisconnected {
                state: EpisodeState::AwaitingAction,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(env.state(), EpisodeState::Terminated);

    // The next reset reconnects.
    env.reset().unwrap();
    assert_eq!(env.state(), EpisodeState::AwaitingAction);
    assert_eq!(mock.counters().connections(), 2);
}

#[test]
fn disconnect_before_first_decision_is_startup_failure() {
    let faults = Faults {
        drop_first_reset: true,
        ..Faults::default()
    };
    let mock = MockSimulator::start(MockConfig::new(2, 3).with_faults(faults)).unwrap();
    let mut env = attach(&mock);

    let err = env.reset().unwrap_err();
    assert!(matches!(err, BridgeError::SimulatorStartupFailure { .. }), "{err}");
    assert!(!err.is_recoverable());
    assert_eq!(env.state(), EpisodeState::Terminated);
    assert!(env.action_space().is_none());

    // No retry happened; the next reset opens a fresh connection.
    assert_eq!(mock.counters().connections(), 1);
    let obs = env.reset().unwrap();
    assert_eq!(obs.len(), 2);
    assert_eq!(env.state(), EpisodeState::AwaitingAction);
    assert_eq!(mock.counters().connections(), 2);
    assert_eq!(mock.counters().resets(), 2);
}

#[test]
fn stalled_step_times_out_and_reset_recovers() {
    let faults = Faults {
        stall_after_steps: Some(1),
        ..Faults::default()
    };
    let mock = MockSimulator::start(MockConfig::new(1, 10).with_faults(faults)).unwrap();
    let mut config = BridgeConfig::attached(mock.address());
    config.step_timeout_secs = 0.2;
    let mut env = NetGymEnv::new(config).unwrap();

    env.reset().unwrap();
    let err = env.step(&ActionBatch::discrete([0])).unwrap_err();
    assert!(err.is_recoverable(), "{err}");
    assert_eq!(env.state(), EpisodeState::AwaitingAction);

    env.reset().unwrap();
    let out = env.step(&ActionBatch::discrete([3])).unwrap();
    assert_eq!(out.reward, vec![3.0]);
}

#[test]
fn missing_handshake_is_invalid_space_descriptor() {
    let faults = Faults {
        omit_handshake: true,
        ..Faults::default()
    };
    let mock = MockSimulator::start(MockConfig::new(1, 3).with_faults(faults)).unwrap();
    let mut env = attach(&mock);

    let err = env.reset().unwrap_err();
    assert!(matches!(err, BridgeError::InvalidSpaceDescriptor(_)));
    assert!(env.action_space().is_none());
    assert_eq!(env.state(), EpisodeState::Terminated);
}

#[test]
fn cancel_unblocks_a_stalled_step() {
    let faults = Faults {
        stall_after_steps: Some(1),
        ..Faults::default()
    };
    let mock = MockSimulator::start(MockConfig::new(1, 10).with_faults(faults)).unwrap();
    let mut config = BridgeConfig::attached(mock.address());
    config.step_timeout_secs = 30.0;
    let mut env = NetGymEnv::new(config).unwrap();
    env.reset().unwrap();

    let cancel = env.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
    });

    let started = Instant::now();
    let err = env.step(&ActionBatch::discrete([0])).unwrap_err();
    assert!(matches!(err, BridgeError::SimulatorDisconnected { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(env.state(), EpisodeState::Terminated);
    canceller.join().unwrap();
}
