//! Multi-controller registry.
//!
//! Runs the discovery loop, owns one session per controller address and
//! keeps the transmission sink informed of membership changes. Sessions do
//! their own reconnecting; the registry only ever adds.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bluest::Adapter;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::SEARCH_WINDOW;
use crate::core::bluetooth::scanner::{BluetoothScanner, DiscoveryFilter};
use crate::core::bluetooth::session::GearVrController;
use crate::core::controller::{Controller, ControllerAddress};
use crate::transmit::{RosterEntry, SnapshotSender};

/// Registry of every controller discovered during this process's lifetime.
pub struct ControllersTracker {
    adapter: Adapter,
    filter: DiscoveryFilter,
    snapshots: SnapshotSender,
    controllers: Arc<Mutex<Vec<Arc<dyn Controller>>>>,
    /// Serializes radio-level connect sequences across every session
    radio_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    discovery: StdMutex<Option<JoinHandle<()>>>,
}

impl ControllersTracker {
    pub fn new(adapter: Adapter, filter: DiscoveryFilter, snapshots: SnapshotSender) -> Self {
        Self {
            adapter,
            filter,
            snapshots,
            controllers: Arc::new(Mutex::new(Vec::new())),
            radio_lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            discovery: StdMutex::new(None),
        }
    }

    /// Starts the background discovery loop. Idempotent.
    pub fn run(&self) {
        let mut discovery = self.discovery.lock().unwrap();
        if discovery.is_some() {
            warn!("Controller search already running");
            return;
        }

        info!("Start searching for controllers...");
        let handle = tokio::spawn(Self::discovery_loop(
            self.adapter.clone(),
            self.filter.clone(),
            self.snapshots.clone(),
            self.controllers.clone(),
            self.radio_lock.clone(),
            self.cancel.clone(),
        ));
        *discovery = Some(handle);
    }

    async fn discovery_loop(
        adapter: Adapter,
        filter: DiscoveryFilter,
        snapshots: SnapshotSender,
        controllers: Arc<Mutex<Vec<Arc<dyn Controller>>>>,
        radio_lock: Arc<Mutex<()>>,
        cancel: CancellationToken,
    ) {
        let scanner = BluetoothScanner::new(adapter.clone());

        while !cancel.is_cancelled() {
            let found = match scanner.scan(&filter, SEARCH_WINDOW, &cancel).await {
                Ok(found) => found,
                Err(e) => {
                    error!("Controller scan failed: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(SEARCH_WINDOW) => {}
                    }
                    continue;
                }
            };

            let mut known = controllers.lock().await;
            let mut roster_changed = false;

            for discovered in found {
                if is_known(&known, discovered.address) {
                    debug!("Found {} - already added", discovered.display_name);
                    continue;
                }

                info!("Found {} - NEW", discovered.display_name);
                let controller = GearVrController::new(
                    adapter.clone(),
                    discovered.device,
                    discovered.display_name,
                    discovered.address,
                    radio_lock.clone(),
                    snapshots.clone(),
                );
                controller.initialize();
                known.push(Arc::new(controller));
                roster_changed = true;
            }

            if roster_changed {
                let roster = known
                    .iter()
                    .map(|c| RosterEntry {
                        display_name: c.display_name().to_string(),
                        address: c.address(),
                    })
                    .collect();
                drop(known);
                snapshots.update_roster(roster).await;
            }
        }

        debug!("Controller search stopped");
    }

    /// Stops discovery, then disposes every session (powering connected
    /// controllers off) before returning.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let discovery = self.discovery.lock().unwrap().take();
        if let Some(discovery) = discovery {
            if let Err(e) = discovery.await {
                if !e.is_cancelled() {
                    error!("Discovery loop ended abnormally: {e}");
                }
            }
        }

        let controllers: Vec<_> = self.controllers.lock().await.drain(..).collect();
        for controller in controllers {
            controller.shutdown().await;
        }
        info!("Controllers tracker shut down");
    }
}

fn is_known(controllers: &[Arc<dyn Controller>], address: ControllerAddress) -> bool {
    controllers.iter().any(|c| c.address() == address)
}
