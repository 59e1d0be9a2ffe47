//! Time-boxed BLE advertisement scanning for controllers.

use std::collections::HashSet;

use anyhow::Result;
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, info};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{CONTROLLER_NAME, SCAN_POLL_INTERVAL};
use crate::core::controller::ControllerAddress;

/// How discovered advertisements are matched against controller names
#[derive(Debug, Clone)]
pub enum DiscoveryFilter {
    /// Substring match against the advertised local name
    NameContains(String),
    /// Exact match against any name in the list
    AllowList(Vec<String>),
}

impl DiscoveryFilter {
    /// Filter matching the Gear VR Controller family
    pub fn controller_default() -> Self {
        Self::NameContains(CONTROLLER_NAME.to_string())
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::NameContains(fragment) => name.contains(fragment),
            Self::AllowList(names) => names.iter().any(|n| n == name),
        }
    }
}

/// One controller seen during a scan pass
#[derive(Clone)]
pub struct DiscoveredController {
    pub device: Device,
    pub display_name: String,
    pub address: ControllerAddress,
}

/// Advertisement scanner over one Bluetooth adapter
pub struct BluetoothScanner {
    adapter: Adapter,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Scans for controllers matching `filter`, deduplicated by address.
    ///
    /// Runs for at least `window`; if nothing has been found by then, keeps
    /// scanning until at least one controller appears or `cancel` fires.
    /// Callers wanting a bounded search impose their own outer timeout.
    pub async fn scan(
        &self,
        filter: &DiscoveryFilter,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredController>> {
        let mut scan_stream = self.adapter.scan(&[]).await?;
        let started = Instant::now();
        let mut found: Vec<DiscoveredController> = Vec::new();
        let mut seen: HashSet<ControllerAddress> = HashSet::new();

        while found.is_empty() || started.elapsed() < window {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(SCAN_POLL_INTERVAL) => {}
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let rssi = discovered.rssi;
                            let device = discovered.device;
                            let name = device.name().unwrap_or_default();
                            if !filter.matches(&name) {
                                continue;
                            }

                            let address =
                                ControllerAddress::from_device_id(&device.id().to_string());
                            if !seen.insert(address) {
                                continue;
                            }

                            debug!("Advertisement from {name} ({address}), RSSI: {rssi:?}");
                            found.push(DiscoveredController {
                                device,
                                display_name: name,
                                address,
                            });
                        }
                        None => {
                            info!("Bluetooth scan stream has ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(found)
    }
}
