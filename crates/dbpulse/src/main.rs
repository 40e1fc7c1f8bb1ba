//! dbpulse - Database Health Monitor
//!
//! Samples a database server's counters, serves rate indicators through a
//! cache and ships every valid indicator to a historical store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dbpulse::config::{LoggingSection, PulseConfig};
use dbpulse::{Pipeline, build_providers};
use pulse_metrics::{CounterSource, IndicatorKind, SimulatedCounterSource};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "dbpulse")]
#[command(about = "Database health monitor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, env = "DBPULSE_CONFIG", default_value = "/etc/dbpulse/config.toml")]
        config: PathBuf,
    },

    /// Generate a config file with every default filled in
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/dbpulse/config.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Sample one indicator family directly, bypassing cache and broker
    Sample {
        /// Indicator family (qps, network_traffic, connection_usage, cache_hit_rate, database_size)
        #[arg(short, long)]
        kind: IndicatorKind,

        /// Number of samples to take
        #[arg(short = 'n', long, default_value_t = 5)]
        samples: u32,

        /// Path to config file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = PulseConfig::load(&config)?;
            init_tracing(&config.logging)?;
            run(config).await?;
        }

        Commands::InitConfig { output, force } => {
            init_tracing(&LoggingSection::default())?;
            init_config(&output, force)?;
        }

        Commands::Sample {
            kind,
            samples,
            config,
        } => {
            let config = match config {
                Some(path) => PulseConfig::load(&path)?,
                None => PulseConfig::default(),
            };
            init_tracing(&config.logging)?;
            sample(&config, kind, samples).await?;
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingSection) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.filter))?;
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }
    Ok(())
}

async fn run(config: PulseConfig) -> anyhow::Result<()> {
    info!(
        store = %config.store.path.display(),
        kinds = ?config.scheduler.kinds,
        "starting dbpulse"
    );

    let pipeline = Pipeline::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    let report = pipeline.shutdown().await?;
    println!("Sampling rounds: {}", report.rounds);
    if let Some(stats) = report.consumer {
        println!(
            "Consumer: {} acked, {} dead-lettered, {} requeued, {} batches persisted, {} resubscriptions",
            stats.acked,
            stats.dead_lettered,
            stats.requeued,
            stats.batches_persisted,
            stats.resubscriptions
        );
    }

    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }

    PulseConfig::default().save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file as needed, then run:");
    println!("  dbpulse run --config {}", output.display());

    Ok(())
}

async fn sample(config: &PulseConfig, kind: IndicatorKind, samples: u32) -> anyhow::Result<()> {
    let source: Arc<dyn CounterSource> = Arc::new(SimulatedCounterSource::new());
    let provider = build_providers(&source, &config.engine)
        .into_iter()
        .find(|p| p.kind() == kind)
        .ok_or_else(|| anyhow::anyhow!("no provider for {kind}"))?;

    let gap = u64::try_from(config.engine.min_time_diff_ms).unwrap_or(0);
    for n in 0..samples {
        if n > 0 {
            tokio::time::sleep(Duration::from_millis(gap)).await;
        }
        let result = provider.sample().await;
        if !result.is_valid() {
            warn!(%kind, sample = n, "degraded result");
        }
        println!("{}", serde_json::to_string(&result)?);
    }

    Ok(())
}
