//! `octagon`: drives simulated Octagon devices.
//!
//! Usage:
//!   octagon simulate --devices 4
//!   octagon simulate --config octagon.json --verbose
//!   octagon default-config > octagon.json

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use octagon_cli::{simulate, SimulationOptions};
use octagon_engine::OctagonConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "octagon")]
#[command(about = "Octagon trust engine simulator")]
struct Args {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Establish a clique on one device, join the rest, print JSON dumps
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value = "3")]
        devices: usize,

        /// Engine config (JSON); missing fields use defaults
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Per-request budget in seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },
    /// Print the default engine config as JSON
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Simulate {
            devices,
            config,
            timeout_secs,
        } => {
            let config = match config {
                Some(path) => OctagonConfig::from_json_file(&path)
                    .with_context(|| format!("loading config from {}", path.display()))?,
                None => OctagonConfig::default(),
            };
            let options = SimulationOptions {
                devices,
                config,
                timeout: Duration::from_secs(timeout_secs),
            };
            info!(devices, "starting simulation");
            let report = simulate(&options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&OctagonConfig::default())?);
        }
    }
    Ok(())
}
