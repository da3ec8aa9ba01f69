//! netgym command line.
//!
//! Provides three modes of operation:
//! - `random-agent`: drive a simulator with uniformly random actions and print
//!   per-episode statistics
//! - `mock-sim`: run a mock simulator that speaks the wire protocol, for
//!   trying the bridge without a real simulator
//! - `info`: print crate version and protocol constants

use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use netgym_bridge::NetGymEnv;
use netgym_bridge::mock_sim::{Faults, MockConfig, MockCounters, serve_connection};
use netgym_bridge::protocol::{LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use netgym_bridge::supervisor::{ENV_SEED, READY_PREFIX};
use netgym_core::config::BridgeConfig;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Step-based RL bridge to discrete-event network simulators.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run episodes with random actions and print statistics.
    RandomAgent {
        /// TOML bridge configuration.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Scenario directory (overrides the configuration file).
        #[arg(long, conflicts_with = "attach")]
        scenario_dir: Option<PathBuf>,

        /// Attach to a running simulator at HOST:PORT.
        #[arg(long)]
        attach: Option<String>,

        /// Base seed; episode `i` uses `seed + i`.
        #[arg(short, long)]
        seed: Option<u64>,

        /// Number of episodes to run.
        #[arg(short = 'n', long, default_value_t = 1)]
        episodes: u32,

        /// Give up on an episode after this many steps.
        #[arg(short, long, default_value_t = 100_000)]
        max_steps: u64,
    },

    /// Serve the wire protocol with a scripted mock simulator.
    MockSim {
        /// Entities per decision point.
        #[arg(short, long, default_value_t = 3)]
        entities: usize,

        /// Decision points per episode after the first.
        #[arg(short = 'l', long, default_value_t = 5)]
        episode_len: u64,

        /// Observation values per entity.
        #[arg(long, default_value_t = 2)]
        obs_dim: usize,

        /// Discrete actions per entity.
        #[arg(long, default_value_t = 4)]
        actions: u64,

        /// Port to listen on (0 picks a free one).
        #[arg(short, long, default_value_t = 0)]
        port: u16,

        /// Drop the connection at this step.
        #[arg(long)]
        crash_after_steps: Option<u64>,

        /// Print this message to stderr and exit before announcing readiness.
        #[arg(long)]
        fail_startup: Option<String>,
    },

    /// Print crate and protocol information.
    Info,
}

// ---------------------------------------------------------------------------
// Mode implementations
// ---------------------------------------------------------------------------

fn load_config(
    path: Option<PathBuf>,
    scenario_dir: Option<PathBuf>,
    attach: Option<String>,
    seed: Option<u64>,
) -> anyhow::Result<BridgeConfig> {
    let mut config = match path {
        Some(path) => BridgeConfig::from_file(&path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(dir) = scenario_dir {
        config.scenario_dir = Some(dir);
        config.attach = None;
    }
    if attach.is_some() {
        config.attach = attach;
    }
    if seed.is_some() {
        config.seed = seed;
    }
    Ok(config)
}

fn run_random_agent(config: BridgeConfig, episodes: u32, max_steps: u64) -> anyhow::Result<()> {
    let mut env = NetGymEnv::new(config).context("invalid bridge configuration")?;
    let mut rng = rand::thread_rng();
    let mut total_steps = 0;

    for episode in 1..=episodes {
        env.reset().with_context(|| format!("resetting episode {episode}"))?;
        let space = env
            .action_space()
            .context("simulator did not declare an action space")?
            .clone();

        let mut steps = 0_u64;
        let mut reward_sum = 0.0;
        let mut done = false;
        while !done && steps < max_steps {
            let outcome = env
                .step(&space.sample(&mut rng))
                .with_context(|| format!("step {steps} of episode {episode}"))?;
            reward_sum += outcome.reward.first().copied().unwrap_or(0.0);
            steps += 1;
            done = outcome.done;
        }
        total_steps += steps;

        #[allow(clippy::cast_precision_loss)]
        let mean = if steps == 0 { 0.0 } else { reward_sum / steps as f64 };
        println!(
            "episode {episode}: steps={steps}, entities={}, mean_reward[0]={mean:.3}{}",
            space.entity_count(),
            if done { "" } else { " (step limit)" }
        );
    }

    env.close();
    println!("\ntotal: episodes={episodes}, steps={total_steps}");
    Ok(())
}

fn run_mock_sim(config: MockConfig, port: u16, fail_startup: Option<String>) -> anyhow::Result<()> {
    if let Some(message) = fail_startup {
        eprintln!("{message}");
        bail!("startup failure requested");
    }

    let listener = TcpListener::bind(("127.0.0.1", port)).context("binding mock simulator")?;
    let addr = listener.local_addr()?;
    if let Ok(seed) = std::env::var(ENV_SEED) {
        info!(%seed, "mock simulator seed");
    }

    let mut stdout = std::io::stdout();
    writeln!(stdout, "{READY_PREFIX} {addr}")?;
    stdout.flush()?;

    let (stream, peer) = listener.accept().context("accepting bridge connection")?;
    info!(%peer, entities = config.entities, "bridge connected");
    let counters = MockCounters::default();
    let end = serve_connection(stream, &config, &counters)?;
    info!(
        ?end,
        resets = counters.resets(),
        batches = counters.batches(),
        "mock simulator finished"
    );
    Ok(())
}

fn run_info() {
    println!("netgym v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("protocol:");
    println!("  version        {PROTOCOL_VERSION}");
    println!("  framing        {LENGTH_PREFIX_SIZE}-byte little-endian length + JSON");
    println!("  max message    {MAX_MESSAGE_SIZE} bytes");
    println!("  ready line     {READY_PREFIX} <host:port>");
    println!();
    println!("edition: 2024");
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the readiness line in mock-sim mode.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::RandomAgent {
            config,
            scenario_dir,
            attach,
            seed,
            episodes,
            max_steps,
        } => {
            let config = load_config(config, scenario_dir, attach, seed)?;
            run_random_agent(config, episodes, max_steps)
        }
        Commands::MockSim {
            entities,
            episode_len,
            obs_dim,
            actions,
            port,
            crash_after_steps,
            fail_startup,
        } => {
            let config = MockConfig {
                entities,
                episode_len,
                obs_dim,
                actions,
                faults: Faults {
                    crash_after_steps,
                    ..Faults::default()
                },
            };
            run_mock_sim(config, port, fail_startup)
        }
        Commands::Info => {
            run_info();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
