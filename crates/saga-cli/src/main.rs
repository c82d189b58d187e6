//! saga - campaign event journal operator CLI
//!
//! Verifies the journal, appends and lists events, and inspects or repairs
//! the projection-apply outbox of a saga database.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use saga_core::config::SagaConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// saga - campaign event journal operator CLI
#[derive(Parser, Debug)]
#[command(name = "saga")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "saga.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify every campaign's hash chain, signatures and counters
    Verify,

    /// Append one event read from a JSON file
    Append {
        /// Path to the event JSON (`-` for stdin)
        file: PathBuf,
    },

    /// Print one page of a campaign's events as JSON
    Events(commands::events::EventsArgs),

    /// Projection-apply outbox commands
    #[command(subcommand)]
    Outbox(commands::outbox::OutboxCommand),
}

fn load_config(path: &std::path::Path) -> Result<SagaConfig> {
    if path.exists() {
        SagaConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))
    } else {
        debug!(path = %path.display(), "configuration file not found, using defaults");
        Ok(SagaConfig::default())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Verify => commands::verify::run(&config),
        Commands::Append { file } => commands::append::run(&config, &file),
        Commands::Events(args) => commands::events::run(&config, &args),
        Commands::Outbox(cmd) => commands::outbox::run(&config, cmd),
    }
}
