//! Scripted simulator speaking the wire protocol, for trying the bridge
//! without a real simulator.
//!
//! Entity `i` chooses among `actions` discrete actions and observes
//! `obs_dim` values equal to `seq + i / 10`. The reward of entity `i` is the
//! action it took, as `f64`. An episode is `done` at decision point
//! `episode_len`. Faults can be injected to exercise the bridge's failure
//! paths.
//!
//! Only built with the `mock-sim` feature.

use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use netgym_core::spaces::{Handshake, Space};
use netgym_core::types::{EntityAction, EntityObservation, Info};

use crate::framing;
use crate::protocol::{CodecError, DecisionPoint, Reply, Request};

/// Upper observation bound declared by [`handshake`].
pub const OBS_HIGH: f64 = 1.0e6;

/// Handshake for `entities` entities, each choosing among `actions` discrete
/// actions and observing `obs_dim` values in `[0, OBS_HIGH]`.
pub fn handshake(entities: usize, obs_dim: usize, actions: u64) -> Handshake {
    Handshake {
        action_space: vec![Space::Discrete { n: actions }; entities],
        observation_space: vec![
            Space::Box {
                low: vec![0.0; obs_dim],
                high: vec![OBS_HIGH; obs_dim],
            };
            entities
        ],
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Misbehaviour to inject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// Drop the connection instead of answering this step (1-based).
    pub crash_after_steps: Option<u64>,
    /// Never answer this step (1-based) of the first episode that reaches
    /// it on a connection; later requests are still read.
    pub stall_after_steps: Option<u64>,
    /// Send every decision point twice.
    pub duplicate_decisions: bool,
    /// Omit the handshake from the first decision point.
    pub omit_handshake: bool,
    /// Drop the first connection on its first `reset`, before answering.
    pub drop_first_reset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConfig {
    pub entities: usize,
    pub episode_len: u64,
    pub obs_dim: usize,
    pub actions: u64,
    pub faults: Faults,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            entities: 3,
            episode_len: 5,
            obs_dim: 2,
            actions: 4,
            faults: Faults::default(),
        }
    }
}

impl MockConfig {
    pub fn new(entities: usize, episode_len: u64) -> Self {
        Self {
            entities,
            episode_len,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Decision point `seq` of `episode`.
    pub fn decision(&self, episode: u64, seq: u64, reward: Vec<f64>, seed: Option<u64>) -> DecisionPoint {
        #[allow(clippy::cast_precision_loss)]
        let observation = (0..self.entities)
            .map(|entity| EntityObservation::new(vec![seq as f64 + entity as f64 / 10.0; self.obs_dim]))
            .collect();
        let mut info = Info::new();
        #[allow(clippy::cast_precision_loss)]
        info.insert("sim_time".into(), serde_json::json!(seq as f64 * 0.1));
        if let Some(seed) = seed {
            info.insert("seed".into(), serde_json::json!(seed));
        }
        DecisionPoint {
            episode,
            seq,
            observation,
            reward,
            done: seq >= self.episode_len,
            info,
            handshake: (seq == 0 && !self.faults.omit_handshake)
                .then(|| handshake(self.entities, self.obs_dim, self.actions)),
        }
    }
}

/// What the mock has seen and sent, shared with the test.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub connections: AtomicU64,
    pub resets: AtomicU64,
    pub batches: AtomicU64,
    pub decisions: AtomicU64,
    pub shutdowns: AtomicU64,
}

impl MockCounters {
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Distinct decision points sent, duplicates excluded.
    pub fn decisions(&self) -> u64 {
        self.decisions.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> u64 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Why [`serve_connection`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The bridge sent `shutdown`.
    Shutdown,
    /// The bridge closed the connection.
    Disconnected,
    /// A fault closed the connection.
    Crashed,
}

/// Serve one bridge connection until it shuts down or disconnects.
pub fn serve_connection(
    mut stream: TcpStream,
    config: &MockConfig,
    counters: &MockCounters,
) -> Result<SessionEnd, CodecError> {
    counters.connections.fetch_add(1, Ordering::SeqCst);
    let mut current: Option<(u64, Option<u64>)> = None;
    let mut seq = 0;
    let mut stalled = false;

    loop {
        let request = match framing::read_message::<Request>(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(SessionEnd::Disconnected),
            Err(CodecError::Io(e)) if is_disconnect(&e) => return Ok(SessionEnd::Disconnected),
            Err(e) => return Err(e),
        };
        debug!(request = request.type_name(), "mock simulator received");

        let reply = match request {
            Request::Shutdown => {
                counters.shutdowns.fetch_add(1, Ordering::SeqCst);
                return Ok(SessionEnd::Shutdown);
            }
            Request::Reset { episode, seed, .. } => {
                let first = counters.resets.fetch_add(1, Ordering::SeqCst) == 0;
                if first && config.faults.drop_first_reset {
                    warn!(episode, "mock simulator dropping connection on reset");
                    return Ok(SessionEnd::Crashed);
                }
                current = Some((episode, seed));
                seq = 0;
                Reply::Decision(config.decision(episode, 0, vec![0.0; config.entities], seed))
            }
            Request::Step {
                episode,
                seq: answered,
                actions,
            } => {
                counters.batches.fetch_add(1, Ordering::SeqCst);
                let steps = seq + 1;
                match current {
                    Some((current_episode, seed)) if current_episode == episode && answered == seq => {
                        if actions.len() != config.entities {
                            Reply::Error {
                                message: format!("expected {} actions, got {}", config.entities, actions.len()),
                            }
                        } else if config.faults.crash_after_steps == Some(steps) {
                            warn!(steps, "mock simulator crashing");
                            return Ok(SessionEnd::Crashed);
                        } else if !stalled && config.faults.stall_after_steps == Some(steps) {
                            debug!(steps, "mock simulator stalling");
                            stalled = true;
                            continue;
                        } else {
                            seq = steps;
                            let reward = actions.iter().map(action_reward).collect();
                            Reply::Decision(config.decision(episode, seq, reward, seed))
                        }
                    }
                    _ => Reply::Error {
                        message: format!("unexpected step for episode {episode} seq {answered}"),
                    },
                }
            }
        };

        if matches!(reply, Reply::Decision(_)) {
            counters.decisions.fetch_add(1, Ordering::SeqCst);
            if config.faults.duplicate_decisions {
                framing::write_message(&mut stream, &reply)?;
            }
        }
        framing::write_message(&mut stream, &reply)?;
    }
}

#[allow(clippy::cast_precision_loss)]
fn action_reward(action: &EntityAction) -> f64 {
    match action {
        EntityAction::Discrete(value) => *value as f64,
        EntityAction::Continuous(values) => values.iter().sum(),
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use netgym_core::types::ActionBatch;

    use super::*;

    /// Serve one connection on a loopback port and return a client stream.
    fn serve(config: MockConfig) -> (TcpStream, thread::JoinHandle<(SessionEnd, MockCounters)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let counters = MockCounters::default();
            let end = serve_connection(stream, &config, &counters).unwrap();
            (end, counters)
        });
        (client, server)
    }

    fn request(stream: &mut TcpStream, req: &Request) -> Reply {
        framing::write_message(stream, req).unwrap();
        framing::read_message(stream).unwrap().unwrap()
    }

    #[test]
    fn plays_a_full_episode() {
        let (mut stream, server) = serve(MockConfig::new(2, 2));

        let Reply::Decision(first) = request(
            &mut stream,
            &Request::Reset {
                episode: 1,
                seed: Some(5),
                run_id: None,
            },
        ) else {
            panic!("expected decision");
        };
        assert!(first.handshake.is_some());
        assert_eq!(first.entity_count(), 2);
        assert_eq!(first.info["seed"], 5);

        for seq in 0..2 {
            let Reply::Decision(dp) = request(
                &mut stream,
                &Request::Step {
                    episode: 1,
                    seq,
                    actions: ActionBatch::discrete([1, 3]),
                },
            ) else {
                panic!("expected decision");
            };
            assert_eq!(dp.seq, seq + 1);
            assert_eq!(dp.reward, vec![1.0, 3.0]);
            assert_eq!(dp.done, seq == 1);
        }

        framing::write_message(&mut stream, &Request::Shutdown).unwrap();
        let (end, counters) = server.join().unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
        assert_eq!(counters.batches(), 2);
        assert_eq!(counters.decisions(), 3);
        assert_eq!(counters.shutdowns(), 1);
    }

    #[test]
    fn wrong_seq_is_error_reply() {
        let (mut stream, _server) = serve(MockConfig::default());
        request(
            &mut stream,
            &Request::Reset {
                episode: 1,
                seed: None,
                run_id: None,
            },
        );
        let reply = request(
            &mut stream,
            &Request::Step {
                episode: 1,
                seq: 7,
                actions: ActionBatch::discrete([0, 0, 0]),
            },
        );
        assert!(matches!(reply, Reply::Error { .. }));
    }

    #[test]
    fn first_reset_can_be_dropped() {
        let faults = Faults {
            drop_first_reset: true,
            ..Faults::default()
        };
        let (mut stream, server) = serve(MockConfig::new(1, 1).with_faults(faults));
        framing::write_message(
            &mut stream,
            &Request::Reset {
                episode: 1,
                seed: None,
                run_id: None,
            },
        )
        .unwrap();
        let (end, counters) = server.join().unwrap();
        assert_eq!(end, SessionEnd::Crashed);
        assert_eq!(counters.resets(), 1);
        assert_eq!(counters.decisions(), 0);
    }

    #[test]
    fn action_reward_sums_continuous() {
        assert!((action_reward(&EntityAction::Continuous(vec![0.5, 0.25])) - 0.75).abs() < 1e-12);
        assert!((action_reward(&EntityAction::Discrete(2)) - 2.0).abs() < 1e-12);
    }
}
