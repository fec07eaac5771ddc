/*!
 * LUTRA Bluetooth Device Management Daemon
 * Keeps BlueZ device state synchronized and drives discovery/pairing
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

mod bluetooth;
mod config;

use bluetooth::{BluetoothManager, BluezTransport};
use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "lutrad")]
#[command(about = "LUTRA Bluetooth Device Management Daemon")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/lutra/lutrad.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("lutra_daemon={}", log_level))
        .init();

    info!("LUTRA Bluetooth daemon starting...");

    // Load configuration
    let config = DaemonConfig::load(&cli.config)?;

    run_daemon(config).await
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let bus = BluezTransport::new().context("failed to connect to system bus")?;
    let manager = Arc::new(
        BluetoothManager::new(Arc::new(bus))
            .await
            .context("failed to initialize bluetooth engine")?,
    );

    manager.set_on_change(|devices| {
        info!("device registry changed: {} device(s) known", devices.len());
    });
    manager.set_on_connect(|device| {
        info!("device connected: {} ({})", device.name, device.address);
    });

    if config.bluetooth.scan_on_startup {
        let scanner = Arc::clone(&manager);
        let duration = Duration::from_secs(config.bluetooth.startup_scan_secs);
        tokio::spawn(async move {
            if let Err(err) = scanner.scan_for(duration).await {
                warn!("startup scan failed: {err}");
            }
        });
    }

    info!("LUTRA daemon ready");
    wait_for_shutdown().await;

    info!("shutting down...");
    manager.close().await?;
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
