//! The agent-facing environment.
//!
//! [`NetGymEnv`] ties the pieces together: it acquires a
//! [`SimulatorHandle`] on demand, drives the [`EpisodeStateMachine`] over
//! its channel and releases the handle when the session cannot continue.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use netgym_core::config::BridgeConfig;
use netgym_core::spaces::{SpaceDescriptor, VectorSpace};
use netgym_core::types::{ActionBatch, EntityObservation, StepOutcome};

use crate::error::BridgeError;
use crate::handle::SimulatorHandle;
use crate::state_machine::{EpisodeState, EpisodeStateMachine};
use crate::supervisor::{ProcessHandle, ProcessKiller};
use crate::transport::ChannelCanceller;

// ---------------------------------------------------------------------------
// CancelHandle
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CancelTargets {
    /// `None` while the simulator is still starting.
    channel: Option<ChannelCanceller>,
    process: Option<ProcessKiller>,
}

/// Aborts a blocked `reset` or `step` from another thread.
///
/// Cancelling shuts the channel down and kills the simulator process; the
/// blocked call returns [`SimulatorDisconnected`], or
/// [`SimulatorStartupFailure`] while a spawned simulator is still starting,
/// and the next `reset` starts a fresh simulator. An attach still
/// connecting is bounded by the connect timeout only.
///
/// [`SimulatorDisconnected`]: BridgeError::SimulatorDisconnected
/// [`SimulatorStartupFailure`]: BridgeError::SimulatorStartupFailure
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    targets: Arc<Mutex<Option<CancelTargets>>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(targets) = targets.as_ref() {
            info!("cancelling simulator session");
            if let Some(channel) = &targets.channel {
                channel.cancel();
            }
            if let Some(killer) = &targets.process {
                killer.kill();
            }
        }
    }

    fn arm(&self, handle: &SimulatorHandle) {
        *self.targets.lock().unwrap_or_else(PoisonError::into_inner) = Some(CancelTargets {
            channel: Some(handle.canceller()),
            process: handle.killer(),
        });
    }

    fn arm_starting(&self, process: &ProcessHandle) {
        *self.targets.lock().unwrap_or_else(PoisonError::into_inner) = Some(CancelTargets {
            channel: None,
            process: Some(process.killer()),
        });
    }

    fn disarm(&self) {
        *self.targets.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// ---------------------------------------------------------------------------
// NetGymEnv
// ---------------------------------------------------------------------------

/// Synchronous, episodic environment backed by an external simulator.
///
/// Nothing is started until the first [`reset`](Self::reset). Dropping the
/// environment closes it.
///
/// # Example
///
/// ```no_run
/// use netgym_bridge::env::NetGymEnv;
/// use netgym_core::config::BridgeConfig;
///
/// let mut env = NetGymEnv::new(BridgeConfig::for_scenario("scenarios/highway"))?;
/// let observation = env.reset()?;
/// let space = env.action_space().expect("spaces are known after reset").clone();
/// let mut rng = rand::thread_rng();
/// loop {
///     let outcome = env.step(&space.sample(&mut rng))?;
///     if outcome.done {
///         break;
///     }
/// }
/// env.close();
/// # Ok::<(), netgym_bridge::error::BridgeError>(())
/// ```
#[derive(Debug)]
pub struct NetGymEnv {
    config: BridgeConfig,
    machine: EpisodeStateMachine,
    handle: Option<SimulatorHandle>,
    cancel: CancelHandle,
    episodes_started: u64,
    closed: bool,
}

impl NetGymEnv {
    /// Validate `config`. No simulator is started yet.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let machine = EpisodeStateMachine::new(config.step_timeout());
        Ok(Self {
            config,
            machine,
            handle: None,
            cancel: CancelHandle::default(),
            episodes_started: 0,
            closed: false,
        })
    }

    /// Start a new episode.
    ///
    /// The seed sent to the simulator is the configured base seed plus the
    /// number of episodes started so far, or none if no base seed is set.
    pub fn reset(&mut self) -> Result<Vec<EntityObservation>, BridgeError> {
        let seed = self
            .config
            .seed
            .map(|base| base.wrapping_add(self.episodes_started));
        self.run_reset(seed)
    }

    /// Start a new episode with an explicit seed.
    pub fn reset_with_seed(&mut self, seed: u64) -> Result<Vec<EntityObservation>, BridgeError> {
        self.run_reset(Some(seed))
    }

    fn run_reset(&mut self, seed: Option<u64>) -> Result<Vec<EntityObservation>, BridgeError> {
        if self.closed {
            return Err(BridgeError::illegal(
                "reset",
                self.machine.state(),
                "the environment is closed",
            ));
        }

        let respawn = self.config.respawn_per_episode
            || self.handle.as_mut().is_none_or(|handle| !handle.is_alive());
        if respawn {
            self.release("respawn");
            let cancel = self.cancel.clone();
            let acquired =
                SimulatorHandle::acquire_with(&self.config, seed, |process| cancel.arm_starting(process));
            let handle = match acquired {
                Ok(handle) => handle,
                Err(err) => {
                    self.cancel.disarm();
                    return Err(err);
                }
            };
            self.cancel.arm(&handle);
            self.handle = Some(handle);
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(BridgeError::illegal("reset", self.machine.state(), "no simulator"));
        };

        match self
            .machine
            .reset(handle.channel_mut(), seed, self.config.run_id.as_deref())
        {
            Ok(observation) => {
                self.episodes_started += 1;
                Ok(observation)
            }
            Err(err) if err.is_recoverable() => Err(err),
            Err(BridgeError::SimulatorDisconnected { detail, .. }) => {
                let diagnostics = self.release("disconnected during reset");
                Err(BridgeError::SimulatorStartupFailure {
                    reason: format!("simulator went away before its first decision point: {detail}"),
                    diagnostics,
                })
            }
            Err(err) => {
                self.release("reset failed");
                Err(err)
            }
        }
    }

    /// Send one action per entity and return the next decision point.
    pub fn step(&mut self, actions: &ActionBatch) -> Result<StepOutcome, BridgeError> {
        let Some(handle) = self.handle.as_mut() else {
            let reason = if self.closed {
                "the environment is closed"
            } else {
                "no simulator session, call reset"
            };
            return Err(BridgeError::illegal("step", self.machine.state(), reason));
        };

        match self.machine.step(handle.channel_mut(), actions) {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_recoverable() || err.is_caller_error() => Err(err),
            Err(err @ BridgeError::SimulatorDisconnected { .. }) => {
                let diagnostics = self.release("disconnected");
                Err(err.with_diagnostics(diagnostics))
            }
            Err(err) => {
                self.release("protocol failure");
                Err(err)
            }
        }
    }

    /// Shut the simulator down. Further `reset`/`step` calls fail.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release("close");
        info!(episodes = self.episodes_started, "environment closed");
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub const fn state(&self) -> EpisodeState {
        self.machine.state()
    }

    /// Per-entity action spaces; `None` before the first successful reset.
    pub fn action_space(&self) -> Option<&VectorSpace> {
        self.machine.spaces().map(SpaceDescriptor::action_space)
    }

    /// Per-entity observation spaces; `None` before the first successful
    /// reset.
    pub fn observation_space(&self) -> Option<&VectorSpace> {
        self.machine.spaces().map(SpaceDescriptor::observation_space)
    }

    pub const fn space_descriptor(&self) -> Option<&SpaceDescriptor> {
        self.machine.spaces()
    }

    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub const fn episodes_started(&self) -> u64 {
        self.episodes_started
    }

    pub const fn decisions_received(&self) -> u64 {
        self.machine.decisions_received()
    }

    pub const fn batches_sent(&self) -> u64 {
        self.machine.batches_sent()
    }

    /// PID of the owned simulator process, if any.
    pub fn simulator_pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(SimulatorHandle::pid)
    }

    /// Output captured from the current simulator process.
    pub fn diagnostics(&self) -> String {
        self.handle
            .as_ref()
            .map(SimulatorHandle::diagnostics)
            .unwrap_or_default()
    }

    /// Handle for aborting a blocked call from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drop the current simulator session and return its captured output.
    fn release(&mut self, why: &'static str) -> String {
        self.cancel.disarm();
        let Some(mut handle) = self.handle.take() else {
            return String::new();
        };
        self.machine.abandon();
        debug!(why, pid = handle.pid(), "releasing simulator");
        handle.release()
    }
}

impl Drop for NetGymEnv {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
