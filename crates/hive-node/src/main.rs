//! hive-node — drive a simulated swarm from the command line.
//!
//! ```bash
//! # Plan a route over blocks [2, 9)
//! RUST_LOG=info cargo run --bin hive-node -- route --start 2 --end 9
//!
//! # Forward + backward with 8-bit gradients, peer `b` offline
//! cargo run --bin hive-node -- forward --backward --lossy --kill b
//!
//! # Decode 8 positions, killing `c` after step 3
//! cargo run --bin hive-node -- generate --steps 8 --kill c --kill-after 3
//! ```

mod swarm;
mod throughput;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hive_net::{run_backward, run_forward, SimBlock};
use hive_routing::{
    CompressionPolicy, DeclaredCompression, ProtocolCompression, RemoteChain, RoutingMode, SequenceManager,
};
use hive_types::{BlockRange, ClientConfig, Tensor};

use crate::swarm::{LocalSwarm, PeerSpec};
use crate::throughput::{host_throughput, ThroughputParams};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "hive-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Route and run remote block chains over a simulated swarm"
)]
struct Cli {
    /// TOML file with `[routing]` and `[session]` tables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Simulated peers as `id:start-end[@throughput]`, comma separated.
    #[arg(long, global = true, value_delimiter = ',', default_value = "a:0-6,b:4-10,c:6-12,d:8-12")]
    swarm: Vec<PeerSpec>,

    /// Hidden size served by every simulated peer.
    #[arg(long, global = true, default_value_t = 16)]
    hidden: usize,

    #[arg(long, global = true, value_enum, default_value_t = Mode::Fastest)]
    mode: Mode,

    /// Where the measured throughput is cached.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the chain of peers chosen for a block range.
    Route {
        #[arg(long)]
        start: Option<u32>,
        #[arg(long)]
        end: Option<u32>,
    },

    /// Run a forward pass (and optionally backward) and compare with a local
    /// run of the same blocks.
    Forward {
        #[arg(long)]
        start: Option<u32>,
        #[arg(long)]
        end: Option<u32>,
        #[arg(long, default_value_t = 1)]
        batch: usize,
        #[arg(long, default_value_t = 4)]
        seq: usize,
        #[arg(long)]
        backward: bool,
        /// Half-precision activations and 8-bit gradients on the wire.
        #[arg(long)]
        lossy: bool,
        /// Peer to take offline before the pass.
        #[arg(long)]
        kill: Option<String>,
        /// Print a JSON summary instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Decode one position at a time through an inference session.
    Generate {
        #[arg(long, default_value_t = 8)]
        steps: usize,
        /// Peer to take offline mid-session.
        #[arg(long)]
        kill: Option<String>,
        #[arg(long, default_value_t = 3)]
        kill_after: usize,
        #[arg(long)]
        max_length: Option<usize>,
    },

    /// Measure (or read back) the host throughput used for simulated peers.
    Throughput {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Fastest,
    Random,
}

impl From<Mode> for RoutingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fastest => RoutingMode::Fastest,
            Mode::Random  => RoutingMode::Random,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=hive_routing=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None       => ClientConfig::default(),
    };
    let cache_dir = cli
        .cache_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("hive-node"));
    let params = ThroughputParams { hidden_size: cli.hidden, ..ThroughputParams::default() };

    if let Command::Throughput { force } = cli.command {
        let rps = host_throughput(&cache_dir, &params, force)?;
        println!("{rps:.1} tokens/s");
        return Ok(());
    }

    let default_throughput = if cli.swarm.iter().any(|p| p.throughput.is_none()) {
        host_throughput(&cache_dir, &params, false)?
    } else {
        1.0
    };
    let swarm = LocalSwarm::build(&cli.swarm, cli.hidden, default_throughput)?;

    let lossy = matches!(cli.command, Command::Forward { lossy: true, .. });
    let policy: Arc<dyn CompressionPolicy> = if lossy {
        Arc::new(ProtocolCompression::lossy())
    } else {
        Arc::new(DeclaredCompression)
    };
    let manager = Arc::new(
        SequenceManager::spawn(
            swarm.uids(),
            swarm.registry.clone(),
            swarm.transport.clone(),
            policy,
            config.routing.clone(),
        )
        .await?,
    );
    manager.wait_ready().await?;
    let chain = RemoteChain::new(manager.clone(), cli.mode.into())?.with_session_config(config.session.clone());

    let result = match cli.command {
        Command::Route { start, end } => {
            let range = block_range(start, end, swarm.num_blocks)?;
            let sequence = manager.make_sequence(range, cli.mode.into()).await?;
            for span in sequence.spans() {
                println!("{span}");
            }
            Ok(())
        }
        Command::Forward { start, end, batch, seq, backward, kill, json, .. } => {
            let range = block_range(start, end, swarm.num_blocks)?;
            if let Some(peer) = &kill {
                swarm.kill(peer);
            }
            let chain = chain.slice(range.start, range.end)?;
            run_forward_cmd(&chain, [batch, seq, cli.hidden], backward, json).await
        }
        Command::Generate { steps, kill, kill_after, max_length } => {
            let kill = kill.map(|peer| (peer, kill_after));
            run_generate(&chain, &swarm, cli.hidden, steps, max_length.unwrap_or(steps), kill).await
        }
        Command::Throughput { .. } => Ok(()),
    };

    manager.shutdown().await;
    result
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn run_forward_cmd(chain: &RemoteChain, shape: [usize; 3], backward: bool, as_json: bool) -> Result<()> {
    let blocks = SimBlock::range(chain.range());
    let x = random_tensor(&shape, 0)?;
    let pass = chain.forward(&x, None, None).await?;
    let reference = run_forward(&blocks, &x, None)?;
    let route: Vec<String> = pass.spans().map(ToString::to_string).collect();
    let forward_diff = pass.outputs.max_abs_diff(&reference)?;

    let mut backward_diff = None;
    if backward {
        let g = random_tensor(&shape, 1)?.map(|v| v * 0.1);
        let grads = chain.backward(&pass, &g).await?;
        let (expected, _) = run_backward(&blocks, &x, &g, None)?;
        backward_diff = Some(grads.grad_inputs.max_abs_diff(&expected)?);
    }

    if as_json {
        let summary = json!({
            "blocks": chain.range().to_string(),
            "route": route,
            "forward_max_abs_diff": forward_diff,
            "backward_max_abs_diff": backward_diff,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("route: {}", route.join(" "));
        println!("forward max |Δ| vs local: {forward_diff:.2e}");
        if let Some(d) = backward_diff {
            println!("backward max |Δ| vs local: {d:.2e}");
        }
    }
    Ok(())
}

async fn run_generate(
    chain: &RemoteChain,
    swarm: &LocalSwarm,
    hidden: usize,
    steps: usize,
    max_length: usize,
    kill: Option<(String, usize)>,
) -> Result<()> {
    let mut session = chain.inference_session(max_length).await?;
    let mut inputs = Vec::with_capacity(steps);
    let mut last = None;

    for step in 0..steps {
        if let Some((peer, _)) = kill.as_ref().filter(|(_, after)| *after == step) {
            swarm.kill(peer);
        }
        let x = random_tensor(&[1, 1, hidden], step as u64)?;
        let y = session.step(&x).await.with_context(|| format!("step {step}"))?;
        let route: Vec<String> = session.spans().iter().map(ToString::to_string).collect();
        println!("step {step:>3}  |y|max {:.4}  {}", y.abs_max(), route.join(" "));
        inputs.push(x);
        last = Some(y);
    }
    session.close().await?;

    if let Some(last) = last {
        let all = Tensor::cat(&inputs, 1)?;
        let full = run_forward(&SimBlock::range(chain.range()), &all, None)?;
        let expected = full.narrow(1, steps - 1, 1)?;
        info!(steps, "session finished");
        println!("last step max |Δ| vs local: {:.2e}", last.max_abs_diff(&expected)?);
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn block_range(start: Option<u32>, end: Option<u32>, num_blocks: u32) -> Result<BlockRange> {
    let start = start.unwrap_or(0);
    let end = end.unwrap_or(num_blocks);
    BlockRange::new(start, end).with_context(|| format!("bad block range {start}..{end}"))
}

fn random_tensor(shape: &[usize], seed: u64) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..shape.iter().product::<usize>())
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    Ok(Tensor::new(shape.to_vec(), data)?)
}
