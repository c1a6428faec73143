mod cli;
mod commands;
mod config;
mod format;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use commands::{cmd_monitor, cmd_read, cmd_stats, cmd_write};
use config::{Config, resolve_target};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // --quiet and --verbose override RUST_LOG
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let target = resolve_target(&cli.transport, &config)?;
    let rover = commands::connect(&target, config.engine_config(cli.timeout), cli.quiet)?;

    let result = match cli.command {
        Commands::Read { attribute } => cmd_read(&rover, attribute),
        Commands::Write { attribute, bytes } => cmd_write(&rover, attribute, &bytes, cli.quiet),
        Commands::Monitor { seconds } => cmd_monitor(&rover, seconds),
        Commands::Stats { samples, json } => cmd_stats(&rover, samples, json),
    };

    if let Err(e) = rover.end() {
        tracing::warn!("Shutdown did not complete cleanly: {e}");
    }
    result
}
