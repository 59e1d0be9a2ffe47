//! UDP transmission sink.
//!
//! Sessions publish snapshots through a clonable [`SnapshotSender`] handle;
//! a single transmitter task drains the channel in order and ships each
//! snapshot as a small JSON datagram to the configured receiver, tagged
//! with a per-controller topic. Delivery failures are logged and dropped.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::TrackerConfig;
use crate::core::controller::{ControllerAddress, TrackingSnapshot};

/// Buffered snapshots before the publisher starts shedding
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// One controller in the registry's membership list
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub display_name: String,
    pub address: ControllerAddress,
}

enum TransmitEvent {
    Snapshot {
        source: String,
        snapshot: TrackingSnapshot,
    },
    Roster(Vec<RosterEntry>),
}

/// Clonable handle feeding the transmitter task.
#[derive(Clone)]
pub struct SnapshotSender {
    tx: mpsc::Sender<TransmitEvent>,
}

impl SnapshotSender {
    /// Queues one snapshot for delivery. Never blocks the caller: when the
    /// transmitter falls behind, the newest snapshot is shed instead.
    pub fn publish(&self, source: &str, snapshot: TrackingSnapshot) {
        let event = TransmitEvent::Snapshot {
            source: source.to_string(),
            snapshot,
        };
        if self.tx.try_send(event).is_err() {
            debug!("Transmitter backlogged - dropping snapshot for {source}");
        }
    }

    /// Tells the sink about the registry's current membership list.
    pub async fn update_roster(&self, roster: Vec<RosterEntry>) {
        if self.tx.send(TransmitEvent::Roster(roster)).await.is_err() {
            warn!("Transmitter is gone - roster update dropped");
        }
    }
}

/// Datagram layout sent to the receiver
#[derive(Serialize)]
struct TrackingPacket<'a> {
    address: &'a str,
    timestamp: i64,
    data: &'a TrackingSnapshot,
}

/// The transmitter task's state: one UDP socket plus the topic mapping.
pub struct SnapshotTransmitter {
    socket: UdpSocket,
    receiver: std::net::SocketAddr,
    topics: HashMap<String, String>,
    announced: HashSet<String>,
    rx: mpsc::Receiver<TransmitEvent>,
}

impl SnapshotTransmitter {
    /// Binds the outbound socket and hands back the publisher handle.
    pub async fn bind(config: &TrackerConfig) -> Result<(Self, SnapshotSender)> {
        let receiver = config.receiver_addr()?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);

        let transmitter = Self {
            socket,
            receiver,
            topics: config.topic_map(),
            announced: HashSet::new(),
            rx,
        };
        Ok((transmitter, SnapshotSender { tx }))
    }

    /// Drains the channel until every sender handle is dropped.
    pub async fn run(mut self) {
        info!("Transmitting snapshots to {}", self.receiver);

        while let Some(event) = self.rx.recv().await {
            match event {
                TransmitEvent::Roster(roster) => self.announce_new(&roster),
                TransmitEvent::Snapshot { source, snapshot } => {
                    if let Err(e) = self.transmit(&source, &snapshot).await {
                        warn!("Failed to transmit snapshot for {source}: {e}");
                    }
                }
            }
        }

        info!("Transmitter stopped - all publishers gone");
    }

    fn announce_new(&mut self, roster: &[RosterEntry]) {
        for entry in roster {
            if self.announced.insert(entry.display_name.clone()) {
                info!(
                    "Start transmitting for controller {} ({})",
                    entry.display_name, entry.address
                );
            }
        }
    }

    fn topic_for(&self, source: &str) -> String {
        self.topics
            .get(source)
            .cloned()
            .unwrap_or_else(|| format!("/{source}"))
    }

    async fn transmit(&self, source: &str, snapshot: &TrackingSnapshot) -> Result<()> {
        let topic = self.topic_for(source);
        let packet = TrackingPacket {
            address: &topic,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data: snapshot,
        };
        let payload = serde_json::to_vec(&packet)?;
        self.socket.send_to(&payload, self.receiver).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::controller::ButtonStates;

    fn test_config(port: u16) -> TrackerConfig {
        TrackerConfig::from_json(&format!(
            r#"{{
                "receiver_ip": "127.0.0.1",
                "receiver_port": {port},
                "controllers": [
                    {{ "name": "Gear VR Controller(17DB)", "topic": "/left-hand" }}
                ]
            }}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn configured_topic_wins_over_default() {
        let (transmitter, _sender) = SnapshotTransmitter::bind(&test_config(40123)).await.unwrap();
        assert_eq!(
            transmitter.topic_for("Gear VR Controller(17DB)"),
            "/left-hand"
        );
        assert_eq!(
            transmitter.topic_for("Gear VR Controller(3F01)"),
            "/Gear VR Controller(3F01)"
        );
    }

    #[tokio::test]
    async fn snapshots_arrive_as_json_datagrams() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let (transmitter, sender) = SnapshotTransmitter::bind(&test_config(port)).await.unwrap();
        tokio::spawn(transmitter.run());

        let snapshot = TrackingSnapshot {
            quaternion: [0.0, 0.0, 0.0, 1.0],
            touchpad_x: 100,
            touchpad_y: 200,
            touchpad_pressed: true,
            buttons: ButtonStates {
                trigger: true,
                ..ButtonStates::default()
            },
        };
        sender.publish("Gear VR Controller(17DB)", snapshot);

        let mut buf = [0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();

        assert_eq!(value["address"], "/left-hand");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(value["data"]["touchpad_x"], 100);
        assert_eq!(value["data"]["touchpad_pressed"], true);
        assert_eq!(value["data"]["buttons"]["trigger"], true);
        assert_eq!(value["data"]["quaternion"][3], 1.0);
    }

    #[tokio::test]
    async fn publish_never_blocks_when_backlogged() {
        let (_transmitter, sender) = SnapshotTransmitter::bind(&test_config(40125)).await.unwrap();
        // transmitter not running: fill the channel well past capacity
        for _ in 0..(SNAPSHOT_CHANNEL_CAPACITY * 2) {
            sender.publish("Gear VR Controller(17DB)", TrackingSnapshot::default());
        }
    }
}
