//! Tracker configuration.
//!
//! Loaded once at startup and passed down explicitly; a missing or
//! unparseable config halts the process before the core is engaged.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use log::info;
use serde::Deserialize;
use tokio::fs;

use crate::core::bluetooth::scanner::DiscoveryFilter;
use crate::error::TrackerError;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Process configuration: the snapshot receiver endpoint and, optionally,
/// the exact controllers to track.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// IP the snapshot datagrams are sent to
    pub receiver_ip: String,
    /// Port the snapshot datagrams are sent to
    pub receiver_port: u16,
    /// Controllers to track. Empty means any Gear VR controller in range.
    #[serde(default)]
    pub controllers: Vec<ControllerTopic>,
}

/// Maps one controller's advertised name to its output topic
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerTopic {
    /// Advertised local name, matched exactly during discovery
    pub name: String,
    /// Topic the controller's snapshots are published under
    pub topic: String,
}

impl TrackerConfig {
    pub async fn load(path: &Path) -> Result<Self, TrackerError> {
        let raw = fs::read_to_string(path).await?;
        let config = Self::from_json(&raw)?;
        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, TrackerError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn receiver_addr(&self) -> Result<SocketAddr, TrackerError> {
        let ip: IpAddr = self
            .receiver_ip
            .parse()
            .map_err(|source| TrackerError::InvalidReceiver {
                endpoint: format!("{}:{}", self.receiver_ip, self.receiver_port),
                source,
            })?;
        Ok(SocketAddr::new(ip, self.receiver_port))
    }

    /// Discovery filter implied by the config: an explicit allow-list when
    /// controllers are named, the family default otherwise.
    pub fn discovery_filter(&self) -> DiscoveryFilter {
        if self.controllers.is_empty() {
            DiscoveryFilter::controller_default()
        } else {
            DiscoveryFilter::AllowList(self.controllers.iter().map(|c| c.name.clone()).collect())
        }
    }

    /// Controller-name to output-topic mapping
    pub fn topic_map(&self) -> HashMap<String, String> {
        self.controllers
            .iter()
            .map(|c| (c.name.clone(), c.topic.clone()))
            .collect()
    }
}
