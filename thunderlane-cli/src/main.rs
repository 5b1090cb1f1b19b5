//! ThunderLane CLI - operator entrypoint for the lane coordination engine

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime;
use thunderlane_cli::commands::{self, BurstOptions, RunOptions};
use thunderlane_cli::config::ConfigManager;
use thunderlane_cli::parse_level;
use thunderlane_core::topology::{GridShape, PartitionStrategy};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// ThunderLane multi-scale lane coordination engine
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level (RUST_LOG takes precedence)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Config file merged over the bundled defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane in-process over synthetic nodes and lanes
    Run {
        /// Grid extents, WIDTHxHEIGHTxDEPTH
        #[arg(long, default_value = "32x32x32", value_parser = commands::parse_shape)]
        shape: GridShape,

        /// grid_3d, spatial_hash, hilbert_curve or load_balanced
        #[arg(long, default_value = "grid_3d")]
        strategy: PartitionStrategy,

        /// Requested partitions
        #[arg(short, long, default_value = "8")]
        partitions: u32,

        /// Synthetic compute nodes
        #[arg(short, long, default_value = "2")]
        nodes: usize,

        /// Control tick
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        tick: Duration,

        /// Stop after this long instead of waiting for Ctrl-C
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Seed for the synthetic lane load
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Compute a partition plan without distributing it
    Partition {
        /// Grid extents, WIDTHxHEIGHTxDEPTH
        #[arg(long, value_parser = commands::parse_shape)]
        shape: GridShape,

        /// grid_3d, spatial_hash, hilbert_curve or load_balanced
        #[arg(long, default_value = "grid_3d")]
        strategy: PartitionStrategy,

        /// Requested partitions
        #[arg(short = 'n', long, default_value = "8")]
        count: u32,

        /// Print the full plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one consensus burst
    Anneal {
        /// Spins (defaults to consensus.matrix_size)
        #[arg(long)]
        size: Option<usize>,

        /// Sweep budget
        #[arg(long)]
        steps: Option<u32>,

        /// RNG seed
        #[arg(long)]
        seed: Option<u64>,

        /// Starting temperature
        #[arg(long)]
        temperature: Option<f64>,

        /// Lane health as X,Y,Z in [0, 1], applied as a local field
        #[arg(long, value_parser = parse_lane_health)]
        lane_health: Option<[f64; 3]>,

        /// Print the run as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Check the effective configuration
    Validate,
    /// Print one value by dotted key
    Get {
        /// For example consensus.max_steps
        key: String,
    },
    /// Print the config file location
    Path,
}

fn parse_lane_health(text: &str) -> Result<[f64; 3]> {
    let values = text
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .with_context(|| format!("'{part}' is not a number"))
        })
        .collect::<Result<Vec<_>>>()?;
    let [x, y, z] = values.as_slice() else {
        bail!("expected three comma-separated values, got '{text}'");
    };
    let health = [*x, *y, *z];
    if health.iter().any(|h| !(0.0..=1.0).contains(h)) {
        bail!("lane health must lie in [0, 1], got '{text}'");
    }
    Ok(health)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = parse_level(&cli.log_level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let manager = ConfigManager::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            shape,
            strategy,
            partitions,
            nodes,
            tick,
            duration,
            seed,
        } => {
            manager.validate()?;
            let summary = commands::run_control_plane(
                manager.config().clone(),
                RunOptions {
                    shape,
                    strategy,
                    partitions,
                    nodes,
                    tick,
                    duration,
                    seed,
                },
            )
            .await?;
            info!(ticks = summary.ticks, bursts = summary.bursts, "control plane stopped");
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Partition {
            shape,
            strategy,
            count,
            json,
        } => {
            manager.validate()?;
            let plan = commands::plan_partition(manager.config(), shape, strategy, count)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                let metrics = &plan.metrics;
                println!("Strategy: {strategy}");
                println!("Partitions: {}", metrics.partition_count);
                println!("Cells per partition: {}", metrics.cells_per_partition);
                println!(
                    "Partition size: {}..={}",
                    metrics.min_partition_size, metrics.max_partition_size
                );
                println!("Load variance: {:.4}", metrics.load_variance);
            }
        }

        Commands::Anneal {
            size,
            steps,
            seed,
            temperature,
            lane_health,
            json,
        } => {
            manager.validate()?;
            let run = commands::run_burst(
                manager.config(),
                BurstOptions {
                    matrix_size: size,
                    max_steps: steps,
                    seed,
                    initial_temperature: temperature,
                    lane_health,
                },
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                println!("Run: {}", run.id);
                println!("Status: {:?}", run.status);
                println!("Seed: {}", run.seed);
                if let Some(result) = &run.result {
                    println!("Final energy: {:.4}", result.final_energy);
                    println!("Sweeps: {}/{}", result.convergence_steps, run.max_steps);
                }
                println!("Efficiency: {:.3}", run.efficiency_score());
                if let Some(m) = run.lane_magnetization() {
                    println!("Lane magnetization: x={:.3} y={:.3} z={:.3}", m[0], m[1], m[2]);
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", manager.render()?),
            ConfigAction::Validate => {
                manager.validate()?;
                if manager.from_file() {
                    println!("{} is valid", manager.path().display());
                } else {
                    println!("bundled defaults are valid ({} not found)", manager.path().display());
                }
            }
            ConfigAction::Get { key } => match manager.get(&key)? {
                Some(value) => println!("{value}"),
                None => bail!("unknown configuration key: {key}"),
            },
            ConfigAction::Path => println!("{}", manager.path().display()),
        },
    }

    Ok(())
}
