//! One simulator process together with the channel to it.

use std::time::Duration;

use tracing::{debug, info};

use netgym_core::config::BridgeConfig;
use netgym_core::error::ConfigError;

use crate::error::BridgeError;
use crate::framing;
use crate::protocol::Request;
use crate::supervisor::{self, DRAIN_GRACE, ProcessHandle, ProcessKiller};
use crate::transport::{ChannelCanceller, TcpChannel, Transport, TransportError};

/// How long a released simulator gets to exit on its own after `shutdown`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Acquired together, released together: the channel is always closed
/// before the process is terminated.
#[derive(Debug)]
pub struct SimulatorHandle {
    channel: TcpChannel,
    /// `None` when attached to a simulator this bridge did not start.
    process: Option<ProcessHandle>,
}

impl SimulatorHandle {
    /// Attach to `config.attach`, or spawn the scenario launcher and connect
    /// to the address it announces.
    pub fn acquire(config: &BridgeConfig, seed: Option<u64>) -> Result<Self, BridgeError> {
        Self::acquire_with(config, seed, |_| {})
    }

    /// Like [`acquire`](Self::acquire), calling `on_spawn` as soon as a
    /// process exists, before waiting for it to become ready.
    pub fn acquire_with(
        config: &BridgeConfig,
        seed: Option<u64>,
        on_spawn: impl FnOnce(&ProcessHandle),
    ) -> Result<Self, BridgeError> {
        if let Some(address) = &config.attach {
            let channel = TcpChannel::open(address, config.connect_timeout()).map_err(connect_error)?;
            info!(%address, "attached to running simulator");
            return Ok(Self {
                channel,
                process: None,
            });
        }

        let scenario_dir = config
            .scenario_dir
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("scenario_dir".into()))?;
        let mut process = supervisor::spawn(scenario_dir, config, seed)?;
        on_spawn(&process);
        let address = process.await_ready(config.startup_timeout())?;

        match TcpChannel::open(&address.to_string(), config.connect_timeout()) {
            Ok(channel) => {
                info!(pid = process.pid(), %address, "connected to simulator");
                Ok(Self {
                    channel,
                    process: Some(process),
                })
            }
            Err(e) => {
                process.terminate();
                process.drain_output(DRAIN_GRACE);
                Err(BridgeError::SimulatorStartupFailure {
                    reason: format!("announced {address} but refused the connection: {e}"),
                    diagnostics: process.diagnostics(),
                })
            }
        }
    }

    pub fn channel_mut(&mut self) -> &mut TcpChannel {
        &mut self.channel
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    /// Channel open and, if owned, process still running.
    pub fn is_alive(&mut self) -> bool {
        !self.channel.is_closed() && self.process.as_mut().is_none_or(ProcessHandle::is_running)
    }

    pub fn diagnostics(&self) -> String {
        self.process
            .as_ref()
            .map(ProcessHandle::diagnostics)
            .unwrap_or_default()
    }

    pub fn canceller(&self) -> ChannelCanceller {
        self.channel.canceller()
    }

    pub fn killer(&self) -> Option<ProcessKiller> {
        self.process.as_ref().map(ProcessHandle::killer)
    }

    /// Ask the simulator to shut down, close the channel, then make sure the
    /// process is gone. Returns the captured output. Idempotent.
    pub fn release(&mut self) -> String {
        if !self.channel.is_closed() {
            let sent = framing::encode(&Request::Shutdown)
                .map_err(TransportError::from)
                .and_then(|frame| self.channel.send(&frame));
            if let Err(e) = sent {
                debug!(error = %e, "shutdown request not delivered");
            }
        }
        self.channel.close();

        let Some(process) = self.process.as_mut() else {
            return String::new();
        };
        if process.wait_exit(SHUTDOWN_GRACE).is_none() {
            debug!(pid = process.pid(), "simulator ignored shutdown, killing");
        }
        process.terminate();
        process.drain_output(DRAIN_GRACE);
        process.diagnostics()
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn connect_error(err: TransportError) -> BridgeError {
    match err {
        TransportError::Connect { address, source } => BridgeError::Connect { address, source },
        other => BridgeError::Connect {
            address: String::new(),
            source: std::io::Error::other(other.to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn attach_to_closed_port_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = SimulatorHandle::acquire(&BridgeConfig::attached(address), None).unwrap_err();
        assert!(matches!(err, BridgeError::Connect { .. }));
    }

    #[test]
    fn attached_release_sends_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut handle = SimulatorHandle::acquire(&BridgeConfig::attached(address), None).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        assert!(handle.is_alive());
        assert!(handle.pid().is_none());
        assert!(handle.release().is_empty());
        assert!(!handle.is_alive());

        let req: Request = framing::read_message(&mut server).unwrap().unwrap();
        assert_eq!(req, Request::Shutdown);
        handle.release();
    }

    #[cfg(unix)]
    #[test]
    fn launcher_that_exits_is_startup_failure() {
        let mut config = BridgeConfig::for_scenario(std::env::temp_dir());
        config.launcher = "sh".into();
        config.args = vec!["-c".into(), "echo 'license expired' >&2; exit 2".into()];
        let err = SimulatorHandle::acquire(&config, None).unwrap_err();
        assert!(
            matches!(&err, BridgeError::SimulatorStartupFailure { diagnostics, .. } if diagnostics.contains("license expired")),
            "{err}"
        );
    }
}
