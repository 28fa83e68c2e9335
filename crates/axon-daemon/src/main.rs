//! Axon Daemon - Main entry point
//!
//! Runs the bus masters' background searches and serves the REST API.

mod api;
mod config;
mod server;
mod state;
mod ws;

use anyhow::Result;
use axon_discovery::SweepReport;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "axon")]
#[command(about = "1-Wire bus enumeration and device registry daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "axon.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single sweep on every master and exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Axon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;

    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        masters = config.masters.len(),
        families = config.families.len(),
        cadence_ms = config.defaults.search_cadence_ms,
        "Configuration loaded"
    );

    let state = state::AppState::new(config).await?;

    if args.scan_once {
        info!("Running single search on every master");
        for id in state.registry.master_ids().await {
            let Some(master) = state.master(id).await else {
                continue;
            };
            let report = master.search_and_reconcile().await?;
            println!("{}", scan_summary(master.name(), id, &report));
            for slave in master.slaves().await {
                println!("  - {} [{}]", slave.name, family_label(&state, slave.bound_family));
            }
        }
        state.registry.shutdown().await;
    } else {
        let bind = state.config.daemon.bind.clone();
        server::run(state, &bind).await?;
    }

    Ok(())
}

fn scan_summary(name: &str, id: u32, report: &SweepReport) -> String {
    format!(
        "{} (master {}): {} found, {} newly attached, {} attached in total",
        name, id, report.found, report.attached, report.total
    )
}

fn family_label(state: &state::AppState, fid: u8) -> String {
    state
        .registry
        .families()
        .get(fid)
        .map(|family| family.name().to_string())
        .unwrap_or_else(|| "default".to_string())
}
