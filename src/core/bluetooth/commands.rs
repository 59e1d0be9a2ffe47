//! Command protocol for the Gear VR Controller.
//!
//! Commands are 16-bit opcodes written to the controller's write
//! characteristic, high opcode byte first on the wire.

use anyhow::Result;
use log::{debug, info};
use tokio::time::sleep;

use crate::core::bluetooth::constants::KICKSTART_COMMAND_DELAY;

/// Controller commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Power the controller off
    PowerOff,
    /// Start streaming sensor telemetry
    StartSensorStream,
    /// Run the factory calibration routine
    Calibrate,
    /// Keep-alive ping
    KeepAlive,
    /// Enable low-power mode
    LowPowerEnable,
    /// Disable low-power mode
    LowPowerDisable,
    /// Switch to VR mode (high-frequency telemetry)
    EnterVrMode,
}

impl ControllerCommand {
    /// 16-bit opcode of the command
    pub fn opcode(self) -> u16 {
        match self {
            Self::PowerOff => 0x0000,
            Self::StartSensorStream => 0x0100,
            Self::Calibrate => 0x0300,
            Self::KeepAlive => 0x0400,
            Self::LowPowerEnable => 0x0600,
            Self::LowPowerDisable => 0x0700,
            Self::EnterVrMode => 0x0800,
        }
    }

    /// Wire representation: the opcode's high byte leads
    pub fn to_bytes(self) -> [u8; 2] {
        self.opcode().to_be_bytes()
    }
}

/// Anything able to deliver a command to a controller.
///
/// Sessions use a GATT-backed implementation; tests substitute their own.
#[async_trait::async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_command(&self, command: ControllerCommand) -> Result<()>;
}

/// Command sender writing through a bound GATT write characteristic
#[derive(Clone)]
pub struct GattCommandSender {
    write_char: bluest::Characteristic,
}

impl GattCommandSender {
    pub fn new(write_char: bluest::Characteristic) -> Self {
        Self { write_char }
    }
}

#[async_trait::async_trait]
impl CommandSender for GattCommandSender {
    async fn send_command(&self, command: ControllerCommand) -> Result<()> {
        debug!("Sending command to controller: {:?}", command);
        self.write_char.write(&command.to_bytes()).await?;
        Ok(())
    }
}

/// Command sequences layered over a [`CommandSender`]
pub struct CommandExecutor<T: CommandSender> {
    command_sender: T,
}

impl<T: CommandSender> CommandExecutor<T> {
    pub fn new(command_sender: T) -> Self {
        Self { command_sender }
    }

    /// Kickstart sequence: enter VR mode, settle, then start the sensor
    /// stream. Used both at the end of a connect sequence and to revive a
    /// controller that went silent without dropping the link.
    pub async fn kickstart(&self) -> Result<()> {
        sleep(KICKSTART_COMMAND_DELAY).await;
        self.command_sender
            .send_command(ControllerCommand::EnterVrMode)
            .await?;

        sleep(KICKSTART_COMMAND_DELAY).await;
        self.command_sender
            .send_command(ControllerCommand::StartSensorStream)
            .await?;

        info!("Kickstart command pair sent");
        Ok(())
    }

    /// Powers the controller off
    pub async fn power_off(&self) -> Result<()> {
        self.command_sender
            .send_command(ControllerCommand::PowerOff)
            .await
    }

    /// Sends a keep-alive ping
    pub async fn keep_alive(&self) -> Result<()> {
        self.command_sender
            .send_command(ControllerCommand::KeepAlive)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[test]
    fn commands_encode_to_firmware_frames() {
        assert_eq!(ControllerCommand::PowerOff.to_bytes(), [0x00, 0x00]);
        assert_eq!(ControllerCommand::StartSensorStream.to_bytes(), [0x01, 0x00]);
        assert_eq!(ControllerCommand::Calibrate.to_bytes(), [0x03, 0x00]);
        assert_eq!(ControllerCommand::KeepAlive.to_bytes(), [0x04, 0x00]);
        assert_eq!(ControllerCommand::LowPowerEnable.to_bytes(), [0x06, 0x00]);
        assert_eq!(ControllerCommand::LowPowerDisable.to_bytes(), [0x07, 0x00]);
        assert_eq!(ControllerCommand::EnterVrMode.to_bytes(), [0x08, 0x00]);
    }

    #[test]
    fn opcodes_match_the_protocol() {
        assert_eq!(ControllerCommand::StartSensorStream.opcode(), 0x0100);
        assert_eq!(ControllerCommand::EnterVrMode.opcode(), 0x0800);
    }

    /// Records every delivered command; optionally fails the first N sends.
    pub(crate) struct RecordingSender {
        pub sent: Mutex<Vec<ControllerCommand>>,
        pub failures_left: Mutex<u32>,
    }

    impl RecordingSender {
        pub(crate) fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failures_left: Mutex::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl CommandSender for RecordingSender {
        async fn send_command(&self, command: ControllerCommand) -> Result<()> {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("simulated write failure"));
            }
            self.sent.lock().unwrap().push(command);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn kickstart_sends_vr_mode_then_sensor_stream() {
        let sender = RecordingSender::new();
        let executor = CommandExecutor::new(sender);
        executor.kickstart().await.unwrap();

        let sent = executor.command_sender.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ControllerCommand::EnterVrMode,
                ControllerCommand::StartSensorStream
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn kickstart_propagates_write_failure() {
        let sender = RecordingSender::new();
        *sender.failures_left.lock().unwrap() = 1;
        let executor = CommandExecutor::new(sender);

        assert!(executor.kickstart().await.is_err());
        // the failed VR-mode write must not be followed by a stream command
        assert!(executor.command_sender.sent.lock().unwrap().is_empty());
    }
}
