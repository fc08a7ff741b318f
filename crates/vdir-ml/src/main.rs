#![warn(missing_docs)]

//! vdir-ml command line: configuration checks and in-memory bootstrap runs

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vdir_ml::config::LogConfig;
use vdir_ml::{DirConfig, DirectoryService};

#[derive(Parser)]
#[command(name = "vdir-ml")]
#[command(about = "Directory middle layer tools", long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json); defaults apply when omitted.
    #[arg(short, long, env = "VDIR_ML_CONFIG")]
    config: Option<PathBuf>,

    /// Emit log lines as JSON.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then print the effective values.
    CheckConfig,
    /// Build an in-memory directory, add the bootstrap entries and print the
    /// resulting counters.
    Bootstrap,
}

fn init_tracing(log: &LogConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DirConfig::from_file(path)
            .with_context(|| format!("cannot load configuration from {}", path.display()))?,
        None => DirConfig::default(),
    };
    init_tracing(&config.log, cli.json_logs || config.log.json);
    config.validate()?;
    let config = config.normalized();

    match cli.command {
        Command::CheckConfig => {
            tracing::info!(domain = %config.server.domain_dn, "configuration is valid");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Bootstrap => {
            let stats = tokio::task::spawn_blocking(move || -> Result<_> {
                let dir = DirectoryService::in_memory(config);
                dir.bootstrap()?;
                let stats = dir.stats();
                dir.shutdown();
                Ok(stats)
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
