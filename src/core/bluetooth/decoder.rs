//! Telemetry packet decoder.
//!
//! The controller pushes a 60-byte notification containing bit-packed
//! touchpad/button state and little-endian 16-bit sensor words. Decoding is
//! a pure function of the buffer; sessions call it once per notification.

use nalgebra::Vector3;

use crate::core::bluetooth::constants::TELEMETRY_PACKET_LEN;
use crate::core::controller::{ButtonStates, RawSensorSample};
use crate::error::TrackerError;

/// Raw accelerometer word to milli-units
const ACCEL_RAW_FACTOR: f32 = 10000.0 * 9.80665 / 2048.0;
/// Milli-units to g
const ACCEL_CAL_FACTOR: f32 = 0.00001;

/// Raw gyroscope word to milli-units
const GYRO_RAW_FACTOR: f32 = 10000.0 * 0.017453292 / 14.285;
/// Milli-units to rad/s
const GYRO_CAL_FACTOR: f32 = 0.0001;

/// Raw magnetometer word to µT
const MAG_FACTOR: f32 = 0.06;

/// Byte offset of the magnetometer block within the packet
const MAG_BLOCK_OFFSET: usize = 32;

/// One fully decoded telemetry notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedTelemetry {
    pub sample: RawSensorSample,
    /// Touchpad X, 10 bits of raw device units
    pub touchpad_x: u16,
    /// Touchpad Y, 10 bits of raw device units
    pub touchpad_y: u16,
    /// Both-zero is the rest position; a genuine touch at (0, 0) cannot be
    /// told apart from a lifted finger.
    pub touchpad_pressed: bool,
    pub buttons: ButtonStates,
    /// Temperature byte, decoded but not part of the published snapshot
    pub temperature: u8,
}

fn read_i16(data: &[u8], offset: usize) -> f32 {
    i16::from_le_bytes([data[offset], data[offset + 1]]) as f32
}

/// Decodes one telemetry notification.
///
/// Buffers shorter than a full packet are rejected without effect.
pub fn decode(data: &[u8]) -> Result<DecodedTelemetry, TrackerError> {
    if data.len() < TELEMETRY_PACKET_LEN {
        return Err(TrackerError::TruncatedPacket(data.len()));
    }

    let accel = Vector3::new(
        read_i16(data, 4) * ACCEL_RAW_FACTOR * ACCEL_CAL_FACTOR,
        read_i16(data, 6) * ACCEL_RAW_FACTOR * ACCEL_CAL_FACTOR,
        read_i16(data, 8) * ACCEL_RAW_FACTOR * ACCEL_CAL_FACTOR,
    );

    let gyro = Vector3::new(
        read_i16(data, 10) * GYRO_RAW_FACTOR * GYRO_CAL_FACTOR,
        read_i16(data, 12) * GYRO_RAW_FACTOR * GYRO_CAL_FACTOR,
        read_i16(data, 14) * GYRO_RAW_FACTOR * GYRO_CAL_FACTOR,
    );

    let mag = Vector3::new(
        read_i16(data, MAG_BLOCK_OFFSET) * MAG_FACTOR,
        read_i16(data, MAG_BLOCK_OFFSET + 2) * MAG_FACTOR,
        read_i16(data, MAG_BLOCK_OFFSET + 4) * MAG_FACTOR,
    );

    let touchpad_x =
        ((u16::from(data[54] & 0xF) << 6) | (u16::from(data[55] & 0xFC) >> 2)) & 0x3FF;
    let touchpad_y = ((u16::from(data[55] & 0x3) << 8) | u16::from(data[56])) & 0x3FF;

    let button_byte = data[58];
    let buttons = ButtonStates {
        trigger: button_byte & (1 << 0) != 0,
        home: button_byte & (1 << 1) != 0,
        back: button_byte & (1 << 2) != 0,
        touchpad: button_byte & (1 << 3) != 0,
        volume_down: button_byte & (1 << 4) != 0,
        volume_up: button_byte & (1 << 5) != 0,
    };

    Ok(DecodedTelemetry {
        sample: RawSensorSample { gyro, accel, mag },
        touchpad_x,
        touchpad_y,
        touchpad_pressed: touchpad_x != 0 && touchpad_y != 0,
        buttons,
        temperature: data[57],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> [u8; TELEMETRY_PACKET_LEN] {
        [0u8; TELEMETRY_PACKET_LEN]
    }

    #[test]
    fn zero_packet_decodes_to_rest_state() {
        let decoded = decode(&packet()).unwrap();

        assert_eq!(decoded.sample.gyro, Vector3::zeros());
        assert_eq!(decoded.sample.accel, Vector3::zeros());
        assert_eq!(decoded.sample.mag, Vector3::zeros());
        assert_eq!((decoded.touchpad_x, decoded.touchpad_y), (0, 0));
        assert!(!decoded.touchpad_pressed);
        assert_eq!(decoded.buttons, ButtonStates::default());
        assert_eq!(decoded.temperature, 0);
    }

    #[test]
    fn each_button_bit_decodes_independently() {
        let expectations: [(u8, fn(&ButtonStates) -> bool); 6] = [
            (0, |b| b.trigger),
            (1, |b| b.home),
            (2, |b| b.back),
            (3, |b| b.touchpad),
            (4, |b| b.volume_down),
            (5, |b| b.volume_up),
        ];

        for (bit, getter) in expectations {
            let mut data = packet();
            data[58] = 1 << bit;
            let buttons = decode(&data).unwrap().buttons;

            assert!(getter(&buttons), "bit {bit} should set its button");
            let set_count = [
                buttons.trigger,
                buttons.home,
                buttons.back,
                buttons.touchpad,
                buttons.volume_down,
                buttons.volume_up,
            ]
            .iter()
            .filter(|pressed| **pressed)
            .count();
            assert_eq!(set_count, 1, "bit {bit} should set exactly one button");
        }
    }

    #[test]
    fn touchpad_extraction_matches_bit_layout() {
        let mut data = packet();
        data[54] = 0xF0;
        data[55] = 0xFF;
        data[56] = 0x00;
        let decoded = decode(&data).unwrap();

        assert_eq!(decoded.touchpad_x, 0x3F);
        assert_eq!(decoded.touchpad_y, 0x300);
        assert!(decoded.touchpad_pressed);
    }

    #[test]
    fn touchpad_axes_saturate_at_ten_bits() {
        let mut data = packet();
        data[54] = 0x0F;
        data[55] = 0xFF;
        data[56] = 0xFF;
        let decoded = decode(&data).unwrap();

        assert_eq!(decoded.touchpad_x, 0x3FF);
        assert_eq!(decoded.touchpad_y, 0x3FF);
    }

    #[test]
    fn touch_on_one_axis_only_is_not_a_press() {
        let mut data = packet();
        data[56] = 0x40; // y = 64, x = 0
        let decoded = decode(&data).unwrap();

        assert_eq!(decoded.touchpad_y, 64);
        assert!(!decoded.touchpad_pressed);
    }

    #[test]
    fn short_buffers_are_rejected() {
        for len in [0usize, 2, 3, 59] {
            let data = vec![0u8; len];
            match decode(&data) {
                Err(TrackerError::TruncatedPacket(n)) => assert_eq!(n, len),
                other => panic!("expected TruncatedPacket for {len} bytes, got {other:?}"),
            }
        }
    }

    #[test]
    fn sensor_words_scale_to_physical_units() {
        let mut data = packet();
        data[4..6].copy_from_slice(&2048i16.to_le_bytes()); // accel x
        data[10..12].copy_from_slice(&1000i16.to_le_bytes()); // gyro x
        data[32..34].copy_from_slice(&100i16.to_le_bytes()); // mag x
        let sample = decode(&data).unwrap().sample;

        assert!((sample.accel.x - 0.980665).abs() < 1e-4);
        assert!((sample.gyro.x - 1.2217915).abs() < 1e-4);
        assert!((sample.mag.x - 6.0).abs() < 1e-5);
    }

    #[test]
    fn negative_sensor_words_keep_their_sign() {
        let mut data = packet();
        data[6..8].copy_from_slice(&(-2048i16).to_le_bytes()); // accel y
        let sample = decode(&data).unwrap().sample;

        assert!((sample.accel.y + 0.980665).abs() < 1e-4);
    }
}
