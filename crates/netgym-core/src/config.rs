use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

fn default_launcher() -> PathBuf {
    PathBuf::from("./run")
}
const fn default_startup_timeout_secs() -> f64 {
    30.0
}
const fn default_step_timeout_secs() -> f64 {
    10.0
}
const fn default_connect_timeout_secs() -> f64 {
    5.0
}
const fn default_diagnostic_lines() -> usize {
    200
}

/// Upper bound for every timeout option: one day.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// Seconds to `Duration`, clamped to `0..=MAX_TIMEOUT_SECS`; NaN is zero.
fn clamped_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_TIMEOUT_SECS)).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// BridgeConfig
// ---------------------------------------------------------------------------

/// Configuration of one simulator bridge.
///
/// Either `scenario_dir` (spawn a simulator there) or `attach` (connect to a
/// simulator that is already running) must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Directory holding the simulator's scenario assets. The launcher runs
    /// with this as its working directory.
    #[serde(default)]
    pub scenario_dir: Option<PathBuf>,

    /// Program started to launch the simulator (default: `./run`).
    /// Relative paths resolve against `scenario_dir`.
    #[serde(default = "default_launcher")]
    pub launcher: PathBuf,

    /// Extra arguments passed to the launcher.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the simulator process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Address (`host:port`) of an already running simulator. When set, no
    /// process is spawned.
    #[serde(default)]
    pub attach: Option<String>,

    /// Free-form run identifier forwarded to the simulator.
    #[serde(default)]
    pub run_id: Option<String>,

    /// Base seed forwarded to the simulator on reset.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Max wait for the simulator to announce readiness, in seconds.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: f64,

    /// Max wait for each decision point, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: f64,

    /// Max wait for the TCP connection to the simulator, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,

    /// Start a fresh simulator process at every reset.
    #[serde(default)]
    pub respawn_per_episode: bool,

    /// Forward simulator stdout/stderr lines to the log.
    #[serde(default)]
    pub print_simulator_output: bool,

    /// Trailing simulator output lines kept for error diagnostics.
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_lines: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scenario_dir: None,
            launcher: default_launcher(),
            args: Vec::new(),
            env: BTreeMap::new(),
            attach: None,
            run_id: None,
            seed: None,
            startup_timeout_secs: default_startup_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            respawn_per_episode: false,
            print_simulator_output: false,
            diagnostic_lines: default_diagnostic_lines(),
        }
    }
}

impl BridgeConfig {
    /// Config that spawns the simulator from `scenario_dir`.
    pub fn for_scenario(scenario_dir: impl Into<PathBuf>) -> Self {
        Self {
            scenario_dir: Some(scenario_dir.into()),
            ..Self::default()
        }
    }

    /// Config that attaches to a running simulator at `address`.
    pub fn attached(address: impl Into<String>) -> Self {
        Self {
            attach: Some(address.into()),
            ..Self::default()
        }
    }

    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenario_dir.is_none() && self.attach.is_none() {
            return Err(ConfigError::MissingField("scenario_dir".into()));
        }
        if self.attach.is_some() && self.respawn_per_episode {
            return Err(ConfigError::Incompatible(
                "respawn_per_episode requires a spawned simulator, not attach".into(),
            ));
        }
        for (field, value) in [
            ("startup_timeout_secs", self.startup_timeout_secs),
            ("step_timeout_secs", self.step_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            if !value.is_finite() || value <= 0.0 || value > MAX_TIMEOUT_SECS {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    message: format!("must be between 0 and {MAX_TIMEOUT_SECS} seconds, got {value}"),
                });
            }
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        clamped_secs(self.startup_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        clamped_secs(self.step_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        clamped_secs(self.connect_timeout_secs)
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
