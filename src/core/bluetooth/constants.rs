//! Constants used throughout the tracker: GATT UUIDs, protocol timings
//! and the advertised name the controllers are discovered by.

use std::time::Duration;
use uuid::Uuid;

/// Advertised local name of the Gear VR Controller
pub const CONTROLLER_NAME: &str = "Gear VR Controller";

/// The UUID of the controller's custom service (Oculus Threemote)
pub const UUID_CONTROLLER_SERVICE: Uuid = Uuid::from_u128(0x4f63756c_7573_2054_6872_65656d6f7465);

/// The UUID of the controller's notification characteristic
pub const UUID_CONTROLLER_NOTIFY_CHAR: Uuid = Uuid::from_u128(0xc8c51726_81bc_483b_a052_f7a14ea3d281);

/// The UUID of the controller's write characteristic
pub const UUID_CONTROLLER_WRITE_CHAR: Uuid = Uuid::from_u128(0xc8c51726_81bc_483b_a052_f7a14ea3d282);

/// Minimum duration of one discovery scan pass
pub const SEARCH_WINDOW: Duration = Duration::from_secs(3);

/// Cadence of the scan loop while waiting out the search window
pub const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay between connection attempts
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Cadence of the per-session watchdog loop
pub const WATCHDOG_TICK: Duration = Duration::from_millis(50);

/// A connected controller that has been silent for this long needs a kickstart
pub const DATA_STALE_AFTER: Duration = Duration::from_millis(200);

/// Minimum time between kickstart attempts
pub const KICKSTART_COOLDOWN: Duration = Duration::from_secs(3);

/// Settling pause before each command write of the kickstart sequence
pub const KICKSTART_COMMAND_DELAY: Duration = Duration::from_millis(800);

/// Size of a full telemetry notification in bytes
pub const TELEMETRY_PACKET_LEN: usize = 60;
