//! Tracker binary: loads the config, brings the core up and runs until
//! Ctrl-C.

use std::path::PathBuf;

use anyhow::Result;
use bluest::Adapter;
use log::info;

use gearvr_tracker::config::{DEFAULT_CONFIG_PATH, TrackerConfig};
use gearvr_tracker::core::tracker::ControllersTracker;
use gearvr_tracker::error::TrackerError;
use gearvr_tracker::transmit::SnapshotTransmitter;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("gearvr-tracker v{} starting", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = TrackerConfig::load(&config_path).await?;

    let adapter = Adapter::default().await.ok_or(TrackerError::NoAdapter)?;
    adapter.wait_available().await?;
    info!("Bluetooth adapter is available");

    let (transmitter, snapshots) = SnapshotTransmitter::bind(&config).await?;
    tokio::spawn(transmitter.run());

    let tracker = ControllersTracker::new(adapter, config.discovery_filter(), snapshots);
    tracker.run();

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    tracker.shutdown().await;

    Ok(())
}
