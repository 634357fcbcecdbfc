//! FLIP settlement agent entry point.
//!
//! Starts the agent with configuration from a TOML file or defaults.

// Accessors used by tests and embedders.
#![allow(dead_code)]

mod api;
mod config;
mod node;
mod state;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::FlipConfig;
use node::FlipAgent;

/// FLIP settlement agent
#[derive(Parser, Debug)]
#[command(name = "flip-agent", version, about = "FLIP settlement agent")]
struct Args {
    /// Path to the configuration file (TOML).
    #[arg(short, long, default_value = "flip-agent.toml")]
    config: PathBuf,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the API port.
    #[arg(long)]
    api_port: Option<u16>,

    /// Run against in-memory ledger, rail, and attestation collaborators.
    #[arg(long)]
    dry_run: bool,

    /// Generate a default config file and exit.
    #[arg(long)]
    init: bool,
}

fn init_tracing(config: &FlipConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle --init flag
    if args.init {
        let config = FlipConfig::default();
        config.save(&args.config)?;
        println!("wrote default config to {}", args.config.display());
        return Ok(());
    }

    // Load configuration, then apply env secrets and CLI overrides
    let mut config = FlipConfig::load(&args.config)?;
    config.apply_env();
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(api_port) = args.api_port {
        config.api.port = api_port;
    }

    init_tracing(&config);
    tracing::info!("FLIP settlement agent v{}", env!("CARGO_PKG_VERSION"));

    let mut agent = FlipAgent::new(config, args.dry_run)?;
    let report = agent.start().await?;
    tracing::info!(
        attestations_retried = report.attestations_retried,
        escrows_resumed = report.escrows_resumed,
        mintings_retried = report.mintings_retried,
        "startup recovery finished"
    );

    // Set up graceful shutdown on SIGINT
    let trigger = agent.shutdown_trigger();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("received shutdown signal, finishing current event");
        trigger.trigger();
    });

    let stats = agent.run().await?;
    agent.shutdown().await?;
    tracing::info!(
        payments_sent = stats.payments_sent,
        proofs_submitted = stats.proofs_submitted,
        failures = stats.failures,
        "FLIP agent exited cleanly"
    );
    Ok(())
}
