//! Episode state machine enforcing `reset`/`step` ordering.
//!
//! [`EpisodeStateMachine`] owns everything the bridge knows about the current
//! episode and drives one request/response exchange per call over any
//! [`Transport`]. State only changes once a reply has been fully validated;
//! a failed call never leaves a half-applied update behind.
//!
//! ```text
//!            reset             step (done)
//! Unstarted -------> AwaitingAction -------> Terminated
//!                      ^    | step              |
//!                      |    v                   |
//!                      +----+                   |
//!                      ^        reset           |
//!                      +------------------------+
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use netgym_core::spaces::SpaceDescriptor;
use netgym_core::types::{ActionBatch, EntityObservation, StepOutcome};

use crate::error::BridgeError;
use crate::framing;
use crate::protocol::{DecisionPoint, Reply, Request};
use crate::transport::{Transport, TransportError, deadline_after};

// ---------------------------------------------------------------------------
// EpisodeState
// ---------------------------------------------------------------------------

/// Lifecycle of the current episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EpisodeState {
    /// No episode has been started yet.
    #[default]
    Unstarted,
    /// The simulator is paused at a decision point and needs actions.
    AwaitingAction,
    /// The episode ended, or the session failed. Only `reset` is legal.
    Terminated,
}

impl fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unstarted => "unstarted",
            Self::AwaitingAction => "awaiting_action",
            Self::Terminated => "terminated",
        })
    }
}

/// A request that has been sent and not yet answered.
#[derive(Debug, Clone, PartialEq)]
enum InFlight {
    Reset { episode: u64 },
    Step { batch: ActionBatch },
}

// ---------------------------------------------------------------------------
// EpisodeStateMachine
// ---------------------------------------------------------------------------

/// Drives episodes over a [`Transport`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use netgym_bridge::state_machine::{EpisodeState, EpisodeStateMachine};
///
/// let sm = EpisodeStateMachine::new(Duration::from_secs(10));
/// assert_eq!(sm.state(), EpisodeState::Unstarted);
/// assert!(sm.spaces().is_none());
/// ```
#[derive(Debug)]
pub struct EpisodeStateMachine {
    state: EpisodeState,
    spaces: Option<SpaceDescriptor>,
    /// Number of the most recently requested episode; 0 before the first reset.
    episode: u64,
    /// Sequence number of the last consumed decision point.
    seq: u64,
    in_flight: Option<InFlight>,
    step_timeout: Duration,
    decisions_received: u64,
    batches_sent: u64,
}

impl EpisodeStateMachine {
    #[must_use]
    pub const fn new(step_timeout: Duration) -> Self {
        Self {
            state: EpisodeState::Unstarted,
            spaces: None,
            episode: 0,
            seq: 0,
            in_flight: None,
            step_timeout,
            decisions_received: 0,
            batches_sent: 0,
        }
    }

    pub const fn state(&self) -> EpisodeState {
        self.state
    }

    /// Spaces negotiated for the current episode.
    pub const fn spaces(&self) -> Option<&SpaceDescriptor> {
        self.spaces.as_ref()
    }

    /// Number of the most recently requested episode.
    pub const fn episode(&self) -> u64 {
        self.episode
    }

    /// Sequence number of the last consumed decision point.
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether a request is still waiting for its decision point.
    pub const fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Decision points consumed so far (stale and duplicate ones excluded).
    pub const fn decisions_received(&self) -> u64 {
        self.decisions_received
    }

    /// Action batches sent so far.
    pub const fn batches_sent(&self) -> u64 {
        self.batches_sent
    }

    pub const fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Start a new episode and return its first observation.
    ///
    /// Always legal. A request still in flight is abandoned; its late reply
    /// is recognised by its episode number and dropped. The space descriptor
    /// is cleared once the request is sent. On [`Timeout`] the state is left
    /// as it was; any other failure terminates the session.
    ///
    /// [`Timeout`]: BridgeError::Timeout
    pub fn reset(
        &mut self,
        link: &mut impl Transport,
        seed: Option<u64>,
        run_id: Option<&str>,
    ) -> Result<Vec<EntityObservation>, BridgeError> {
        let result = self.try_reset(link, seed, run_id);
        if result.as_ref().is_err_and(|err| !err.is_recoverable()) {
            self.spaces = None;
            self.state = EpisodeState::Terminated;
            self.in_flight = None;
        }
        result
    }

    fn try_reset(
        &mut self,
        link: &mut impl Transport,
        seed: Option<u64>,
        run_id: Option<&str>,
    ) -> Result<Vec<EntityObservation>, BridgeError> {
        self.episode += 1;
        let episode = self.episode;
        if let Some(abandoned) = self.in_flight.take() {
            debug!(?abandoned, episode, "abandoning in-flight request");
        }

        let frame = framing::encode(&Request::Reset {
            episode,
            seed,
            run_id: run_id.map(str::to_owned),
        })?;
        link.send(&frame).map_err(|e| self.disconnected(&e))?;
        self.in_flight = Some(InFlight::Reset { episode });
        // The old episode's spaces no longer describe what the simulator runs.
        self.spaces = None;

        let point = self.await_decision(link, episode, 0)?;
        let spaces = SpaceDescriptor::derive(point.handshake.as_ref(), &point.observation, &point.reward)?;

        info!(
            episode,
            entities = spaces.entity_count(),
            done = point.done,
            "episode started"
        );
        self.in_flight = None;
        self.spaces = Some(spaces);
        self.seq = point.seq;
        self.state = if point.done {
            EpisodeState::Terminated
        } else {
            EpisodeState::AwaitingAction
        };
        Ok(point.observation)
    }

    /// Answer the current decision point and return the next one.
    ///
    /// Fails with [`IllegalCallSequence`] outside [`AwaitingAction`] and with
    /// [`ActionShapeMismatch`] for a batch that does not fit the action
    /// space; nothing is sent in either case. After a [`Timeout`] the same
    /// batch may be passed again to keep waiting for the same reply.
    ///
    /// [`IllegalCallSequence`]: BridgeError::IllegalCallSequence
    /// [`AwaitingAction`]: EpisodeState::AwaitingAction
    /// [`ActionShapeMismatch`]: BridgeError::ActionShapeMismatch
    /// [`Timeout`]: BridgeError::Timeout
    pub fn step(
        &mut self,
        link: &mut impl Transport,
        actions: &ActionBatch,
    ) -> Result<StepOutcome, BridgeError> {
        match self.state {
            EpisodeState::Unstarted => {
                return Err(BridgeError::illegal("step", self.state, "call reset first"));
            }
            EpisodeState::Terminated => {
                return Err(BridgeError::illegal(
                    "step",
                    self.state,
                    "the episode has terminated, call reset",
                ));
            }
            EpisodeState::AwaitingAction => {}
        }

        let resume = match &self.in_flight {
            Some(InFlight::Step { batch }) if batch == actions => true,
            Some(InFlight::Step { .. }) => {
                return Err(BridgeError::illegal(
                    "step",
                    self.state,
                    "a different action batch is still awaiting its decision point",
                ));
            }
            Some(InFlight::Reset { episode }) => {
                return Err(BridgeError::illegal(
                    "step",
                    self.state,
                    format!("reset of episode {episode} is still in flight"),
                ));
            }
            None => false,
        };

        if resume {
            debug!(episode = self.episode, seq = self.seq, "resuming wait for decision point");
        } else {
            let spaces = self
                .spaces
                .as_ref()
                .ok_or_else(|| BridgeError::illegal("step", self.state, "no space descriptor"))?;
            spaces.validate(actions)?;

            let frame = framing::encode(&Request::Step {
                episode: self.episode,
                seq: self.seq,
                actions: actions.clone(),
            })?;
            link.send(&frame).map_err(|e| self.disconnected(&e))?;
            self.batches_sent += 1;
            self.in_flight = Some(InFlight::Step {
                batch: actions.clone(),
            });
        }

        let point = self.await_decision(link, self.episode, self.seq + 1)?;
        let checked = self
            .spaces
            .as_ref()
            .map(|spaces| spaces.check_decision(&point.observation, &point.reward));
        if let Some(Err(e)) = checked {
            return Err(self.fatal(BridgeError::MalformedMessage(format!(
                "decision point {} of episode {}: {e}",
                point.seq, point.episode
            ))));
        }

        self.in_flight = None;
        self.seq = point.seq;
        if point.done {
            self.state = EpisodeState::Terminated;
            info!(episode = self.episode, steps = point.seq, "episode terminated");
        }
        Ok(StepOutcome {
            observation: point.observation,
            reward: point.reward,
            done: point.done,
            info: point.info,
        })
    }

    /// Mark the session dead without talking to the simulator.
    pub fn abandon(&mut self) {
        if self.state != EpisodeState::Unstarted {
            self.state = EpisodeState::Terminated;
        }
        self.in_flight = None;
    }

    /// Receive until decision point `seq` of `episode` arrives.
    ///
    /// Older episodes and already consumed sequence numbers are dropped.
    /// The whole wait, discarded frames included, is bounded by the step
    /// timeout.
    fn await_decision(
        &mut self,
        link: &mut impl Transport,
        episode: u64,
        seq: u64,
    ) -> Result<DecisionPoint, BridgeError> {
        let deadline = deadline_after(self.step_timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out());
            }

            let point = match link.receive(remaining) {
                Ok(Reply::Decision(point)) => point,
                Ok(Reply::Error { message }) => {
                    warn!(episode, %message, "simulator reported an error");
                    return Err(self.fatal(BridgeError::Simulator { message }));
                }
                Err(TransportError::Timeout(_)) => return Err(self.timed_out()),
                Err(TransportError::Frame(e)) => return Err(self.fatal(e.into())),
                Err(e) => return Err(self.disconnected(&e)),
            };

            if point.episode < episode {
                debug!(stale_episode = point.episode, seq = point.seq, episode, "discarding stale decision point");
                continue;
            }
            if point.episode > episode {
                return Err(self.fatal(BridgeError::MalformedMessage(format!(
                    "decision point for episode {} while episode {episode} is current",
                    point.episode
                ))));
            }
            if point.seq < seq {
                warn!(episode, seq = point.seq, expected = seq, "discarding duplicate decision point");
                continue;
            }
            if point.seq > seq {
                return Err(self.fatal(BridgeError::MalformedMessage(format!(
                    "decision point {} of episode {episode} skips expected {seq}",
                    point.seq
                ))));
            }
            if point.observation.len() != point.reward.len() {
                return Err(self.fatal(BridgeError::MalformedMessage(format!(
                    "{} observations but {} rewards",
                    point.observation.len(),
                    point.reward.len()
                ))));
            }

            self.decisions_received += 1;
            return Ok(point);
        }
    }

    fn timed_out(&self) -> BridgeError {
        debug!(episode = self.episode, waited = ?self.step_timeout, "no decision point yet");
        BridgeError::Timeout {
            waited: self.step_timeout,
            state: self.state,
        }
    }

    fn fatal(&mut self, err: BridgeError) -> BridgeError {
        warn!(episode = self.episode, error = %err, "session terminated");
        self.state = EpisodeState::Terminated;
        self.in_flight = None;
        err
    }

    fn disconnected(&mut self, err: &TransportError) -> BridgeError {
        let state = self.state;
        warn!(episode = self.episode, %state, error = %err, "simulator disconnected");
        self.state = EpisodeState::Terminated;
        self.in_flight = None;
        BridgeError::SimulatorDisconnected {
            state,
            detail: err.to_string(),
            diagnostics: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
