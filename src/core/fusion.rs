//! Orientation fusion adapter.
//!
//! Wraps the Madgwick AHRS filter and converts its output quaternion to the
//! consumer's axis convention. The filter is a hyperparameter-tuned black
//! box; this module owns nothing but the unit plumbing around it.

use ahrs::{Ahrs, Madgwick};
use log::debug;
use nalgebra::{UnitQuaternion, Vector3};

/// Native output period of the controller. Madgwick is sensitive to this.
pub const SAMPLE_PERIOD: f32 = 1.0 / 68.846_817;

/// Filter gain matched to the controller's output rate
pub const FILTER_GAIN: f32 = 0.352;

/// Remaps a filter quaternion (w, x, y, z) to the consumer's axis
/// convention. Must stay bit-exact for snapshot compatibility.
pub fn remap_quaternion(q: &UnitQuaternion<f32>) -> [f32; 4] {
    [-q.i, -q.k, -q.j, q.w]
}

/// Per-session fusion state: one Madgwick filter plus the last good
/// orientation, reused whenever an update is rejected.
pub struct OrientationFilter {
    filter: Madgwick<f32>,
    last_orientation: UnitQuaternion<f32>,
}

impl OrientationFilter {
    pub fn new() -> Self {
        Self {
            filter: Madgwick::new(SAMPLE_PERIOD, FILTER_GAIN),
            last_orientation: UnitQuaternion::identity(),
        }
    }

    /// Feeds one gyro/accel sample pair and returns the fused orientation
    /// in the consumer's axis convention.
    ///
    /// The filter rejects degenerate samples (a zero accelerometer norm
    /// cannot be normalized); the previous orientation is reported then so
    /// consumers always see a usable quaternion.
    pub fn update(&mut self, gyro: &Vector3<f32>, accel: &Vector3<f32>) -> [f32; 4] {
        match self.filter.update_imu(gyro, accel) {
            Ok(orientation) => self.last_orientation = *orientation,
            Err(e) => debug!("AHRS update rejected: {e:?}"),
        }
        remap_quaternion(&self.last_orientation)
    }
}

impl Default for OrientationFilter {
    fn default() -> Self {
        Self::new()
    }
}
