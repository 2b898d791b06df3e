//! mbridge Daemon - Main entry point
//!
//! Runs the aggregated bridge node with the devices from the configuration
//! file and, when configured, a controller for commissioned peers. Bridge
//! events are written to stdout as JSON lines.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use mbridge_bridge::Bridge;
use mbridge_controller::ControllerNode;
use mbridge_core::BridgeEvent;
use mbridge_stack::loopback::LoopbackStack;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mbridge")]
#[command(about = "Bridge devices into an aggregated Matter node")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mbridge.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Erase the bridge node storage and start with a new identity
    #[arg(long)]
    reset_storage: bool,
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
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("mbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;

    // The in-process stack is the only backend shipped with the daemon
    let stack = LoopbackStack::new();

    let bridge = Bridge::new(config.bridge.clone(), Arc::new(stack.clone()));
    let forwarder = forward_events(bridge.subscribe());

    bridge
        .initialize_bridge(args.reset_storage)
        .await
        .context("Failed to initialize bridge")?;

    for device in &config.devices {
        bridge
            .add_endpoint(
                &device.device_type,
                device.id.as_str(),
                device.info(),
                device.attributes.clone(),
            )
            .await
            .with_context(|| format!("Failed to add device {}", device.id))?;
    }

    bridge.start_bridge().await.context("Failed to start bridge")?;

    let state = bridge.commissioning_state().await?;
    if state.commissioning_window_open {
        bridge.open_commissioning_window().await?;
        info!(
            manual = %state.pairing_codes.manual_pairing_code,
            qr = %state.pairing_codes.qr_pairing_code,
            "Bridge is ready for commissioning"
        );
    }

    let controller = match config.controller.clone() {
        Some(controller_config) => {
            let mut controller = ControllerNode::new(controller_config, Arc::new(stack.clone()));
            controller
                .initialize()
                .await
                .context("Failed to initialize controller")?;
            let nodes = controller.commissioned_nodes().await?;
            info!(count = nodes.len(), "Controller ready");
            Some(controller)
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(controller) = controller {
        if let Err(e) = controller.close().await {
            warn!(error = %e, "Failed to close controller");
        }
    }
    bridge.close().await?;
    forwarder.abort();

    Ok(())
}

/// Write bridge events to stdout, one JSON document per line
fn forward_events(mut rx: broadcast::Receiver<BridgeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode bridge event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event forwarder lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
