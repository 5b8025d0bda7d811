//! Autoplug simulator - Main entry point
//!
//! Runs the autoplug engine against a TOML scenario of scripted factories
//! and prints every notification as a JSON line on stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autoplug_common::{AutoplugEvent, EngineConfig};
use autoplug_engine::sim::Scenario;
use autoplug_engine::DecodeBin;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for autoplug-sim
#[derive(Parser, Debug)]
#[command(name = "autoplug-sim")]
#[command(about = "Drive the autoplug engine with a scripted scenario")]
#[command(version)]
struct Args {
    /// Scenario file describing the input and the available factories
    #[arg(short, long)]
    scenario: PathBuf,

    /// Scenario whose input is queued as the next input (its factories are
    /// ignored)
    #[arg(short, long)]
    next: Option<PathBuf>,

    /// Engine config file
    #[arg(short, long, env = "AUTOPLUG_CONFIG")]
    config: Option<PathBuf>,

    /// Report end of stream on every stream of each group as it becomes
    /// active, playing through to the end
    #[arg(long)]
    play: bool,

    /// Stop after this long without a notification
    #[arg(long, default_value = "500")]
    settle_ms: u64,

    /// Print the final manager state as JSON
    #[arg(long)]
    snapshot: bool,

    /// Log level for the engine crates (overrides the config file)
    #[arg(long, env = "AUTOPLUG_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Install the subscriber; logs go to stderr (or the configured file) so
/// stdout stays machine-readable
fn init_tracing(level: &str, file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "autoplug_engine={0},autoplug_common={0},autoplug_sim={0}",
            level
        )
        .into()
    });
    let writer = match file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(file.is_none())
                .with_writer(writer),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, config.logging.file.as_deref())?;

    let scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("Failed to load scenario {}", args.scenario.display()))?;
    let next = args
        .next
        .as_deref()
        .map(|path| {
            Scenario::load(path)
                .with_context(|| format!("Failed to load scenario {}", path.display()))
        })
        .transpose()?;

    let (registry, factories) = scenario.build_registry();
    info!(
        "Loaded scenario {} ({} factories)",
        args.scenario.display(),
        factories.len()
    );

    let bin = Arc::new(DecodeBin::new(config, registry).context("Failed to create DecodeBin")?);
    let mut rx = bin.subscribe();

    if let Err(e) = bin.set_input(scenario.input()) {
        warn!("Input setup failed: {}", e);
    }
    if let Some(next) = &next {
        bin.expect_next_input();
        if let Err(e) = bin.set_next_input(next.input()) {
            warn!("Next input setup failed: {}", e);
        }
    }

    let settle = Duration::from_millis(args.settle_ms);
    loop {
        let event = match tokio::time::timeout(settle, rx.recv()).await {
            Err(_) => {
                info!("No notification for {:?}, stopping", settle);
                break;
            }
            Ok(Err(RecvError::Lagged(n))) => {
                warn!("Missed {} notifications", n);
                continue;
            }
            Ok(Err(RecvError::Closed)) => break,
            Ok(Ok(event)) => event,
        };

        println!("{}", serde_json::to_string(&event)?);

        match &event {
            AutoplugEvent::GroupSwitched { streams, .. } if args.play => {
                let ids: Vec<_> = streams
                    .iter()
                    .filter(|s| !s.muted)
                    .map(|s| s.stream_id)
                    .collect();
                let bin = Arc::clone(&bin);
                // stream_eos blocks while a successor is being built
                tokio::task::spawn_blocking(move || {
                    for id in ids {
                        if let Err(e) = bin.stream_eos(id) {
                            warn!("EOS on {} failed: {}", id, e);
                        }
                    }
                });
            }
            AutoplugEvent::Drained { .. } => break,
            _ => {}
        }
    }

    if args.snapshot {
        println!("{}", serde_json::to_string_pretty(&bin.snapshot())?);
    }

    bin.stop();
    info!("Simulation finished");
    Ok(())
}
