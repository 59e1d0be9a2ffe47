//! Controller identity and tracking-state types, plus the capability
//! interface the registry works against.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use nalgebra::Vector3;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 48-bit Bluetooth hardware address of a controller.
///
/// This is the identity key for deduplication across discovery passes and
/// the registry. On platforms whose BLE backend hides the hardware address
/// the key is derived from a digest of the platform device id instead, so
/// the one-session-per-address invariant still holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerAddress(u64);

impl ControllerAddress {
    const MASK: u64 = 0xFFFF_FFFF_FFFF;

    pub fn from_raw(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Extracts the hardware address from a platform device-id string
    /// (MAC address on most platforms, an opaque UUID on macOS).
    pub fn from_device_id(device_id: &str) -> Self {
        let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").unwrap();
        if let Some(mac) = re.find_iter(device_id).last() {
            let raw = mac
                .as_str()
                .split([':', '-'])
                .fold(0u64, |acc, octet| (acc << 8) | u64::from_str_radix(octet, 16).unwrap_or(0));
            return Self::from_raw(raw);
        }

        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        Self::from_raw(hasher.finish())
    }
}

impl fmt::Display for ControllerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octets: Vec<String> = (0..6)
            .rev()
            .map(|i| format!("{:02X}", (self.0 >> (i * 8)) & 0xFF))
            .collect();
        write!(f, "{}", octets.join(":"))
    }
}

/// States of the six physical buttons
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonStates {
    pub trigger: bool,
    pub home: bool,
    pub back: bool,
    pub touchpad: bool,
    pub volume_up: bool,
    pub volume_down: bool,
}

/// Latest decoded-and-fused tracking state of one controller.
///
/// This is what observers receive and what goes over the wire to the
/// transmission sink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    /// Orientation in the consumer's axis convention
    pub quaternion: [f32; 4],
    /// Touchpad X in raw device units, 10 bits (max observed value 315)
    pub touchpad_x: u16,
    /// Touchpad Y in raw device units, 10 bits
    pub touchpad_y: u16,
    /// Finger on the touchpad. (0, 0) is the rest position, so a touch at
    /// the exact origin is indistinguishable from no touch.
    pub touchpad_pressed: bool,
    pub buttons: ButtonStates,
}

impl Default for TrackingSnapshot {
    fn default() -> Self {
        Self {
            // identity orientation after the consumer axis remap
            quaternion: [0.0, 0.0, 0.0, 1.0],
            touchpad_x: 0,
            touchpad_y: 0,
            touchpad_pressed: false,
            buttons: ButtonStates::default(),
        }
    }
}

/// One decoded telemetry sample in physical units, consumed immediately by
/// the fusion filter and never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSensorSample {
    /// Angular rate in rad/s
    pub gyro: Vector3<f32>,
    /// Acceleration in g
    pub accel: Vector3<f32>,
    /// Magnetic field in µT
    pub mag: Vector3<f32>,
}

/// Capability interface of one tracked controller.
///
/// Only the Gear VR family is implemented today; the registry goes through
/// this interface so another controller family stays a drop-in.
#[async_trait]
pub trait Controller: Send + Sync {
    fn address(&self) -> ControllerAddress;

    fn display_name(&self) -> &str;

    fn is_connected(&self) -> bool;

    fn latest_snapshot(&self) -> TrackingSnapshot;

    /// Flags the intent to connect. Never blocks; the session's own worker
    /// picks the intent up.
    fn initialize(&self);

    /// Tears the session down: stops the worker, powers the peripheral off
    /// if connected and releases its GATT resources.
    async fn shutdown(&self);
}
