//! Error types for the tracker library.

use thiserror::Error;

/// Errors surfaced by the tracker library
#[derive(Debug, Error)]
pub enum TrackerError {
    /// No usable Bluetooth adapter on this machine
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    /// Configuration file could not be read
    #[error("failed to read config file: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("failed to parse config file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Configured receiver endpoint is not a valid address
    #[error("invalid receiver endpoint {endpoint}: {source}")]
    InvalidReceiver {
        endpoint: String,
        source: std::net::AddrParseError,
    },

    /// Telemetry notification shorter than a full packet
    #[error("telemetry packet too short: {0} bytes")]
    TruncatedPacket(usize),
}
