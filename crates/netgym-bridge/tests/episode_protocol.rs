//! Integration test: episode state machine against a scripted transport.
//!
//! Checks ordering rules and exactly-once consumption without any socket:
//! 1. Illegal calls and malformed batches send nothing
//! 2. Stale and duplicate decision points are discarded
//! 3. A timed-out step is resumed, never resent
//! 4. A lost channel terminates the episode

use std::time::Duration;

use netgym_bridge::protocol::{Reply, Request};
use netgym_bridge::state_machine::{EpisodeState, EpisodeStateMachine};
use netgym_bridge::transport::TransportError;
use netgym_bridge::BridgeError;
use netgym_core::types::{ActionBatch, EntityAction};
use netgym_test_utils::{SpyTransport, decision, decision_reply};

const TIMEOUT: Duration = Duration::from_millis(50);

fn started(entities: usize) -> (EpisodeStateMachine, SpyTransport) {
    let mut sm = EpisodeStateMachine::new(TIMEOUT);
    let mut spy = SpyTransport::with_replies([decision_reply(1, 0, entities, 2, false)]);
    sm.reset(&mut spy, None, None).unwrap();
    (sm, spy)
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[test]
fn step_before_reset_sends_nothing() {
    let mut sm = EpisodeStateMachine::new(TIMEOUT);
    let mut spy = SpyTransport::new();
    let err = sm.step(&mut spy, &ActionBatch::discrete([0])).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::IllegalCallSequence {
            state: EpisodeState::Unstarted,
            ..
        }
    ));
    assert_eq!(spy.send_count(), 0);
    assert_eq!(spy.receive_count(), 0);
}

#[test]
fn step_after_done_is_illegal_until_reset() {
    let (mut sm, mut spy) = started(1);
    spy.push_reply(decision_reply(1, 1, 1, 2, true));
    assert!(sm.step(&mut spy, &ActionBatch::discrete([0])).unwrap().done);
    assert_eq!(sm.state(), EpisodeState::Terminated);

    let sends = spy.send_count();
    for _ in 0..3 {
        let err = sm.step(&mut spy, &ActionBatch::discrete([0])).unwrap_err();
        assert!(matches!(err, BridgeError::IllegalCallSequence { .. }));
    }
    assert_eq!(spy.send_count(), sends);

    spy.push_reply(decision_reply(2, 0, 1, 2, false));
    sm.reset(&mut spy, None, None).unwrap();
    assert_eq!(sm.state(), EpisodeState::AwaitingAction);
}

#[test]
fn entity_count_mismatch_sends_nothing() {
    let (mut sm, mut spy) = started(3);
    let sends = spy.send_count();
    let err = sm.step(&mut spy, &ActionBatch::discrete([0, 1])).unwrap_err();
    assert!(matches!(err, BridgeError::ActionShapeMismatch(_)));
    assert_eq!(spy.send_count(), sends);
    assert_eq!(sm.state(), EpisodeState::AwaitingAction);
}

#[test]
fn wrong_action_kind_sends_nothing() {
    let (mut sm, mut spy) = started(1);
    let sends = spy.send_count();
    let batch = ActionBatch::new(vec![EntityAction::Continuous(vec![0.5])]);
    assert!(matches!(
        sm.step(&mut spy, &batch),
        Err(BridgeError::ActionShapeMismatch(_))
    ));
    assert_eq!(spy.send_count(), sends);
}

#[test]
fn step_echoes_episode_and_seq() {
    let (mut sm, mut spy) = started(2);
    spy.push_reply(decision_reply(1, 1, 2, 2, false));
    spy.push_reply(decision_reply(1, 2, 2, 2, false));
    sm.step(&mut spy, &ActionBatch::discrete([1, 2])).unwrap();
    sm.step(&mut spy, &ActionBatch::discrete([3, 0])).unwrap();

    let sent = spy.sent_requests();
    assert!(matches!(sent[0], Request::Reset { episode: 1, .. }));
    assert!(matches!(sent[1], Request::Step { episode: 1, seq: 0, .. }));
    assert!(matches!(sent[2], Request::Step { episode: 1, seq: 1, .. }));
    assert_eq!(sm.batches_sent(), 2);
    assert_eq!(sm.decisions_received(), 3);
}

#[test]
fn double_reset_gives_fresh_descriptor() {
    let mut sm = EpisodeStateMachine::new(TIMEOUT);
    let mut spy = SpyTransport::with_replies([
        decision_reply(1, 0, 2, 2, false),
        decision_reply(2, 0, 4, 3, false),
    ]);
    let first = sm.reset(&mut spy, None, None).unwrap();
    let second = sm.reset(&mut spy, None, None).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 4);
    assert_eq!(sm.spaces().unwrap().entity_count(), 4);
    assert_eq!(sm.spaces().unwrap().observation_space().shape(), vec![3; 4]);
    assert_eq!(sm.episode(), 2);
}

#[test]
fn zero_entity_episode() {
    let mut sm = EpisodeStateMachine::new(TIMEOUT);
    let mut spy = SpyTransport::with_replies([decision_reply(1, 0, 0, 2, false), decision_reply(1, 1, 0, 2, true)]);
    assert!(sm.reset(&mut spy, None, None).unwrap().is_empty());
    let out = sm.step(&mut spy, &ActionBatch::default()).unwrap();
    assert!(out.observation.is_empty());
    assert!(out.reward.is_empty());
    assert!(out.done);
}

// ---------------------------------------------------------------------------
// Stale and duplicate decision points
// ---------------------------------------------------------------------------

#[test]
fn stale_decision_after_reset_is_discarded() {
    let (mut sm, mut spy) = started(1);
    // Late answer to a step of episode 1 arrives after the reset of episode 2.
    spy.push_reply(decision_reply(1, 1, 1, 2, false));
    spy.push_reply(decision_reply(2, 0, 1, 2, false));
    let obs = sm.reset(&mut spy, None, None).unwrap();
    assert_eq!(obs.len(), 1);
    assert_eq!(sm.episode(), 2);
    assert_eq!(spy.remaining(), 0);
}

#[test]
fn duplicate_decision_is_discarded() {
    let (mut sm, mut spy) = started(1);
    spy.push_reply(decision_reply(1, 0, 1, 2, false));
    spy.push_reply(decision_reply(1, 1, 1, 2, false));
    let out = sm.step(&mut spy, &ActionBatch::discrete([0])).unwrap();
    assert!((out.observation[0][0] - 1.0).abs() < 1e-12);
    assert_eq!(sm.seq(), 1);
    assert_eq!(sm.decisions_received(), 2);
}

#[test]
fn seq_gap_is_malformed() {
    let (mut sm, mut spy) = started(1);
    spy.push_reply(decision_reply(1, 3, 1, 2, false));
    let err = sm.step(&mut spy, &ActionBatch::discrete([0])).unwrap_err();
    assert!(matches!(err, BridgeError::MalformedMessage(_)));
    assert_eq!(sm.state(), EpisodeState::Terminated);
}

#[test]
fn future_episode_is_malformed() {
    let mut sm = EpisodeStateMachine::new(TIMEOUT);
    let mut spy = SpyTransport::with_replies([decision_reply(5, 0, 1, 2, false)]);
    let err = sm.reset(&mut spy, None, None).unwrap_err();
    assert!(matches!(err, BridgeError::MalformedMessage(_)));
    assert!(sm.spaces().is_none());
}

#[test]
fn entity_count_change_mid_episode_is_malformed() {
    let (mut sm, mut spy) = started(2);
    spy.push_reply(decision_reply(1, 1, 3, 2, false));
    let err = sm.step(&mut spy, &ActionBatch::discrete([0, 0])).unwrap_err();
    assert!(matches!(err, BridgeError::MalformedMessage(_)));
}

#[test]
fn observation_reward_length_disagreement_is_malformed() {
    let (mut sm, mut spy) = started(2);
    let mut dp = decision(1, 1, 2, 2, false);
    dp.reward.pop();
    spy.push_reply(Reply::Decision(dp));
    assert!(matches!(
        sm.step(&mut spy, &ActionBatch::discrete([0, 0])),
        Err(BridgeError::MalformedMessage(_))
    ));
}

#[test]
fn error_reply_terminates() {
    let mut sm = EpisodeStateMachine::new(TIMEOUT);
    let mut spy = SpyTransport::with_replies([Reply::Error {
        message: "unsupported protocol version".into(),
    }]);
    let err = sm.reset(&mut spy, None, None).unwrap_err();
    assert!(matches!(err, BridgeError::Simulator { .. }));
    assert_eq!(sm.state(), EpisodeState::Terminated);
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[test]
fn timeout_retry_does_not_resend() {
    let (mut sm, mut spy) = started(1);
    let batch = ActionBatch::discrete([2]);

    let err = sm.step(&mut spy, &batch).unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(sm.state(), EpisodeState::AwaitingAction);
    assert!(sm.is_in_flight());
    let sends = spy.send_count();

    spy.push_reply(decision_reply(1, 1, 1, 2, false));
    let out = sm.step(&mut spy, &batch).unwrap();
    assert!(!out.done);
    assert_eq!(spy.send_count(), sends);
    assert_eq!(sm.batches_sent(), 1);
    assert!(!sm.is_in_flight());
}

#[test]
fn timeout_retry_with_other_batch_is_illegal() {
    let (mut sm, mut spy) = started(1);
    sm.step(&mut spy, &ActionBatch::discrete([2])).unwrap_err();
    let sends = spy.send_count();
    let err = sm.step(&mut spy, &ActionBatch::discrete([1])).unwrap_err();
    assert!(matches!(err, BridgeError::IllegalCallSequence { .. }));
    assert_eq!(spy.send_count(), sends);
}

#[test]
fn reset_abandons_timed_out_step() {
    let (mut sm, mut spy) = started(1);
    sm.step(&mut spy, &ActionBatch::discrete([2])).unwrap_err();

    spy.push_reply(decision_reply(1, 1, 1, 2, false));
    spy.push_reply(decision_reply(2, 0, 1, 2, false));
    sm.reset(&mut spy, None, None).unwrap();
    assert_eq!(sm.state(), EpisodeState::AwaitingAction);
    assert_eq!(sm.seq(), 0);
    assert_eq!(sm.episode(), 2);
}

// ---------------------------------------------------------------------------
// Disconnects
// ---------------------------------------------------------------------------

#[test]
fn channel_closed_mid_episode_terminates() {
    let (mut sm, mut spy) = started(1);
    spy.push_error(TransportError::ChannelClosed);
    let err = sm.step(&mut spy, &ActionBatch::discrete([0])).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::SimulatorDisconnected {
            state: EpisodeState::AwaitingAction,
            ..
        }
    ));
    assert_eq!(sm.state(), EpisodeState::Terminated);
    assert!(!err.is_recoverable());
}

#[test]
fn send_on_closed_channel_is_disconnect() {
    let (mut sm, mut spy) = started(1);
    spy.push_error(TransportError::ChannelClosed);
    sm.step(&mut spy, &ActionBatch::discrete([0])).unwrap_err();

    let err = sm.reset(&mut spy, None, None).unwrap_err();
    assert!(matches!(err, BridgeError::SimulatorDisconnected { .. }));
    assert!(sm.spaces().is_none());
}
