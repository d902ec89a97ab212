// Differential drive inverse kinematics
// Converts body-frame velocities (v, w) to left/right wheel angular velocities.

use serde::Serialize;

use crate::config::{WHEEL_BASE, WHEEL_RADIUS};

/// Wheel angular velocities in rad/s (positive = forward)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WheelVelocity {
    pub left: f32,
    pub right: f32,
}

impl WheelVelocity {
    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

/// Robot geometry used by the conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveGeometry {
    /// Distance between the two wheels (m)
    pub wheel_base: f32,
    pub wheel_radius: f32,
}

impl Default for DriveGeometry {
    fn default() -> Self {
        Self {
            wheel_base: WHEEL_BASE,
            wheel_radius: WHEEL_RADIUS,
        }
    }
}

impl DriveGeometry {
    pub fn new(wheel_base: f32, wheel_radius: f32) -> Self {
        Self {
            wheel_base,
            wheel_radius,
        }
    }

    pub fn body_to_wheel(&self, v: f32, w: f32) -> WheelVelocity {
        body_to_wheel_with_params(v, w, self.wheel_base, self.wheel_radius)
    }
}

/// Convert body-frame velocities to wheel angular velocities
///
/// # Arguments
/// * `v` - Linear velocity in m/s (positive = forward)
/// * `w` - Angular velocity in rad/s (positive = counter-clockwise)
///
/// Velocities are not bounded here; the caller keeps them physically sane.
pub fn body_to_wheel(v: f32, w: f32) -> WheelVelocity {
    body_to_wheel_with_params(v, w, WHEEL_BASE, WHEEL_RADIUS)
}

pub fn body_to_wheel_with_params(v: f32, w: f32, wheel_base: f32, wheel_radius: f32) -> WheelVelocity {
    let right = (2.0 * v + w * wheel_base) / (2.0 * wheel_radius);
    let left = (2.0 * v - w * wheel_base) / (2.0 * wheel_radius);
    WheelVelocity { left, right }
}
