mod aggregator;
mod backend;
mod codec;
mod config;
mod error;
mod logging;
mod publish;
mod queue;
mod scheduler;
mod session;
mod supervisor;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use uuid::Uuid;

use crate::backend::{BluerPeripheral, BtleplugCentral, CentralBackend, PeripheralBackend};
use crate::config::Config;
use crate::logging::LogFormat;
use crate::scheduler::Scheduler;

fn service_uuid() -> Uuid {
    Uuid::parse_str("4fafc201-1fb5-459e-8fcc-c5c9c331914b").expect("valid UUID literal")
}

fn characteristic_uuid() -> Uuid {
    Uuid::parse_str("beb5483e-36e1-4688-b7f5-ea07361b26a8").expect("valid UUID literal")
}

#[derive(Parser)]
#[command(name = "ble-sensor-aggregator")]
#[command(about = "Time-aligns a fixed roster of BLE sensor peers and republishes them as one compressed frame")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// tracing EnvFilter directive, e.g. "info" or "debug,btleplug=warn".
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// tracing-subscriber output format.
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the aggregator: central-side subscriptions plus the peripheral advertisement.
    Run,
    /// Parse and validate a config file without starting the service.
    CheckConfig,
    /// Scan once for the configured roster and report which peers are
    /// currently discoverable, without starting the aggregator.
    Scan {
        /// Override the configured scan timeout, in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::CheckConfig => check_config(&cli.config),
        Commands::Run => run(&cli.config).await,
        Commands::Scan { timeout_ms } => scan(&cli.config, timeout_ms).await,
    }
}

fn check_config(path: &PathBuf) -> Result<()> {
    let config = Config::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    println!("config OK: {} peer(s) in roster", config.roster.len());
    for peer in &config.roster {
        println!("  {} ({}) -> {}", peer.display_name, peer.address, peer.short_name());
    }
    Ok(())
}

async fn run(path: &PathBuf) -> Result<()> {
    let config = Arc::new(Config::load(path).with_context(|| format!("failed to load {}", path.display()))?);

    let central = Arc::new(
        BtleplugCentral::new()
            .await
            .context("failed to initialize BLE central backend")?,
    );
    let peripheral = Arc::new(
        BluerPeripheral::new()
            .await
            .context("failed to initialize BLE peripheral backend")?,
    );

    peripheral
        .register_service(service_uuid(), characteristic_uuid())
        .await
        .context("failed to register GATT service")?;
    peripheral
        .register_advertisement(config.advertisement_name.clone(), vec![service_uuid()], 0x0000)
        .await
        .context("failed to register advertisement")?;

    tracing::info!(peers = config.roster.len(), "starting scheduler");
    let mut scheduler = Scheduler::new(config.clone(), central, peripheral, characteristic_uuid());
    scheduler.run().await.context("scheduler exited with an error")?;
    Ok(())
}

async fn scan(path: &PathBuf, timeout_override_ms: Option<u64>) -> Result<()> {
    let config = Config::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let central = BtleplugCentral::new()
        .await
        .context("failed to initialize BLE central backend")?;

    let addresses: HashSet<String> = config.roster.iter().map(|peer| peer.address.clone()).collect();
    let timeout = timeout_override_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.scan_timeout());

    let mut stream = central.scan(addresses.clone()).await.context("failed to start scan")?;
    let mut found = HashMap::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        if found.len() >= addresses.len() {
            break;
        }
        tokio::select! {
            _ = &mut deadline => break,
            next = stream.next() => {
                match next {
                    Some(device) => { found.insert(device.address.clone(), device); }
                    None => break,
                }
            }
        }
    }

    println!("found {}/{} roster peer(s):", found.len(), addresses.len());
    for peer in &config.roster {
        match found.get(&peer.address) {
            Some(device) => {
                let name = device.name.as_deref().unwrap_or("<no name>");
                println!("  {} ({}) -> found, advertised name {name}", peer.display_name, peer.address);
            }
            None => println!("  {} ({}) -> not seen", peer.display_name, peer.address),
        }
    }

    Ok(())
}
