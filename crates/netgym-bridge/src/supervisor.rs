//! Simulator process lifecycle.
//!
//! [`spawn`] starts the scenario launcher, [`ProcessHandle::await_ready`]
//! waits for it to announce where it listens, [`ProcessHandle::terminate`]
//! tears it down. Output of the child is captured on background threads into
//! a bounded buffer that is attached to startup and disconnect errors.
//!
//! On unix the launcher runs as the leader of its own process group, and
//! teardown signals the whole group: a `./run` script that forks the real
//! simulator takes the simulator down with it.
//!
//! The simulator announces readiness with a single stdout line:
//!
//! ```text
//! NETGYM_READY 127.0.0.1:40123
//! ```

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use netgym_core::config::BridgeConfig;

use crate::transport::deadline_after;

/// Prefix of the stdout line that announces the listening address.
pub const READY_PREFIX: &str = "NETGYM_READY";

/// Environment variable carrying the configured run id.
pub const ENV_RUN_ID: &str = "NETGYM_RUN_ID";
/// Environment variable carrying the episode seed.
pub const ENV_SEED: &str = "NETGYM_SEED";
/// Environment variable carrying the absolute scenario directory.
pub const ENV_SCENARIO_DIR: &str = "NETGYM_SCENARIO_DIR";

const EXIT_POLL: Duration = Duration::from_millis(50);
pub(crate) const DRAIN_GRACE: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// SupervisorError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Simulator failed to start: {reason}")]
    StartupFailed { reason: String, diagnostics: String },
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

/// Last `capacity` lines written by the child, oldest first.
#[derive(Debug)]
struct OutputLog {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: usize,
}

impl OutputLog {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!("[... {} earlier lines dropped]\n", self.dropped));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

type SharedLog = Arc<Mutex<OutputLog>>;

#[derive(Debug)]
enum Readiness {
    Announced(SocketAddr),
    BadAnnouncement(String),
    StdoutClosed,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    const fn tag(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

fn parse_announcement(line: &str) -> Option<Result<SocketAddr, String>> {
    let rest = line.trim().strip_prefix(READY_PREFIX)?;
    let address = rest.trim();
    let parsed = address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| format!("unparseable ready address {address:?}"));
    Some(parsed)
}

#[allow(clippy::needless_pass_by_value)]
fn pump(
    source: impl Read,
    stream: Stream,
    pid: u32,
    log: SharedLog,
    echo: bool,
    ready: Option<Sender<Readiness>>,
    done: Sender<()>,
) {
    let mut announced = false;
    for line in BufReader::new(source).lines() {
        let Ok(line) = line else { break };
        if echo {
            info!(pid, stream = stream.tag(), "{line}");
        }
        if let (false, Some(tx)) = (announced, &ready) {
            if let Some(result) = parse_announcement(&line) {
                announced = true;
                let msg = match result {
                    Ok(addr) => Readiness::Announced(addr),
                    Err(reason) => Readiness::BadAnnouncement(reason),
                };
                let _ = tx.send(msg);
            }
        }
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("[{}] {line}", stream.tag()));
    }
    if let Some(tx) = ready {
        let _ = tx.send(Readiness::StdoutClosed);
    }
    let _ = done.send(());
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

/// Path of the program to execute for `launcher`.
///
/// Absolute paths and bare program names (looked up on `PATH`) are used as
/// given; anything else is relative to the scenario directory.
pub fn resolve_launcher(scenario_dir: &Path, launcher: &Path) -> PathBuf {
    let bare = launcher.components().count() == 1 && !launcher.starts_with(".");
    if launcher.is_absolute() || bare {
        launcher.to_path_buf()
    } else {
        scenario_dir.join(launcher)
    }
}

/// Start the simulator for `scenario_dir`.
///
/// The child runs inside `scenario_dir` with stdin closed. Its stdout and
/// stderr are captured; stdout is also watched for the [`READY_PREFIX`]
/// line consumed by [`ProcessHandle::await_ready`].
pub fn spawn(
    scenario_dir: &Path,
    config: &BridgeConfig,
    seed: Option<u64>,
) -> Result<ProcessHandle, SupervisorError> {
    let scenario_dir = scenario_dir
        .canonicalize()
        .map_err(|source| SupervisorError::Spawn {
            program: scenario_dir.join(&config.launcher),
            source,
        })?;
    let program = resolve_launcher(&scenario_dir, &config.launcher);

    let mut command = Command::new(&program);
    command
        .args(&config.args)
        .current_dir(&scenario_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env(ENV_SCENARIO_DIR, &scenario_dir);
    if let Some(run_id) = &config.run_id {
        command.env(ENV_RUN_ID, run_id);
    }
    if let Some(seed) = seed {
        command.env(ENV_SEED, seed.to_string());
    }
    command.envs(&config.env);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    info!(pid, program = %program.display(), dir = %scenario_dir.display(), "simulator spawned");

    let log: SharedLog = Arc::new(Mutex::new(OutputLog::new(config.diagnostic_lines)));
    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let echo = config.print_simulator_output;

    let mut readers = 0;
    if let Some(stdout) = child.stdout.take() {
        let (log, done) = (Arc::clone(&log), done_tx.clone());
        thread::spawn(move || pump(stdout, Stream::Stdout, pid, log, echo, Some(ready_tx), done));
        readers += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        let log = Arc::clone(&log);
        thread::spawn(move || pump(stderr, Stream::Stderr, pid, log, echo, None, done_tx));
        readers += 1;
    }

    Ok(ProcessHandle {
        child: Arc::new(Mutex::new(child)),
        pid,
        program,
        log,
        ready_rx,
        done_rx,
        readers,
        exit_status: None,
        group_killed: Arc::new(AtomicBool::new(false)),
    })
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// An owned simulator process. Dropping it terminates the process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Arc<Mutex<Child>>,
    pid: u32,
    program: PathBuf,
    log: SharedLog,
    ready_rx: Receiver<Readiness>,
    done_rx: Receiver<()>,
    readers: usize,
    exit_status: Option<ExitStatus>,
    /// Set once the group has been signalled; after the launcher is reaped
    /// its pid may be reused, so the group is never signalled twice.
    group_killed: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Wait for the readiness line and return the announced address.
    ///
    /// On failure the process is terminated and the error carries whatever
    /// the simulator printed.
    pub fn await_ready(&mut self, timeout: Duration) -> Result<SocketAddr, SupervisorError> {
        let deadline = deadline_after(timeout);
        let reason = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break format!("not ready within {timeout:?}");
            }
            match self.ready_rx.recv_timeout(remaining.min(EXIT_POLL)) {
                Ok(Readiness::Announced(addr)) => {
                    info!(pid = self.pid, %addr, "simulator ready");
                    return Ok(addr);
                }
                Ok(Readiness::BadAnnouncement(reason)) => break reason,
                Ok(Readiness::StdoutClosed) | Err(RecvTimeoutError::Disconnected) => {
                    break match self.wait_exit(DRAIN_GRACE) {
                        Some(status) => format!("exited with {status} before announcing readiness"),
                        None => "closed stdout before announcing readiness".to_string(),
                    };
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(status) = self.try_status() {
                        break format!("exited with {status} before announcing readiness");
                    }
                }
            }
        };

        warn!(pid = self.pid, %reason, "simulator startup failed");
        self.terminate();
        self.drain_output(DRAIN_GRACE);
        Err(SupervisorError::StartupFailed {
            reason,
            diagnostics: self.diagnostics(),
        })
    }

    /// Exit status, if the process has exited. Never blocks.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(Some(status)) = child.try_wait() {
                self.exit_status = Some(status);
            }
        }
        self.exit_status
    }

    pub fn is_running(&mut self) -> bool {
        self.try_status().is_none()
    }

    /// Poll for exit for up to `grace`.
    pub fn wait_exit(&mut self, grace: Duration) -> Option<ExitStatus> {
        let deadline = deadline_after(grace);
        loop {
            if let Some(status) = self.try_status() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL.min(grace));
        }
    }

    /// Kill the process group, then reap the process. Safe to call any
    /// number of times.
    pub fn terminate(&mut self) -> Option<ExitStatus> {
        // Descendants may outlive the launcher, so the group is signalled
        // even when the launcher has already exited.
        if !self.group_killed.swap(true, Ordering::SeqCst) {
            kill_group(self.pid);
        }
        if self.try_status().is_some() {
            return self.exit_status;
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = child.kill() {
            debug!(pid = self.pid, error = %e, "kill failed, process already gone");
        }
        match child.wait() {
            Ok(status) => {
                debug!(pid = self.pid, %status, "simulator terminated");
                self.exit_status = Some(status);
            }
            Err(e) => warn!(pid = self.pid, error = %e, "failed to reap simulator"),
        }
        self.exit_status
    }

    /// Captured output, most recent lines last.
    pub fn diagnostics(&self) -> String {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).render()
    }

    /// Handle able to kill this process from another thread.
    pub fn killer(&self) -> ProcessKiller {
        ProcessKiller {
            child: Arc::clone(&self.child),
            pid: self.pid,
            group_killed: Arc::clone(&self.group_killed),
        }
    }

    /// Give the reader threads up to `grace` to flush the last output.
    ///
    /// Readers are never joined: a process that left the group can keep the
    /// pipes open.
    pub fn drain_output(&mut self, grace: Duration) {
        let deadline = deadline_after(grace);
        while self.readers > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(()) => self.readers -= 1,
                Err(_) => break,
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Kills a simulator process from any thread.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    child: Arc<Mutex<Child>>,
    pid: u32,
    group_killed: Arc<AtomicBool>,
}

impl ProcessKiller {
    /// Send a kill signal to the process group. The owning
    /// [`ProcessHandle`] still reaps the launcher.
    pub fn kill(&self) {
        if !self.group_killed.swap(true, Ordering::SeqCst) {
            kill_group(self.pid);
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = child.kill();
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, error = %e, "process group already gone");
    }
}

#[cfg(not(unix))]
const fn kill_group(_pid: u32) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
