//! Fixed sensor and board orientations.

use crate::types::{Mat3, Vec3};
use nalgebra::Rotation3;
use serde::{Deserialize, Serialize};

/// Mounting rotation, named by the roll/pitch/yaw that takes the sensor
/// frame onto the body frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Yaw45,
    Yaw90,
    Yaw135,
    Yaw180,
    Yaw225,
    Yaw270,
    Yaw315,
    Roll180,
    Roll180Yaw45,
    Roll180Yaw90,
    Roll180Yaw135,
    Pitch180,
    Roll180Yaw225,
    Roll180Yaw270,
    Roll180Yaw315,
    Roll90,
    Roll270,
    Pitch90,
    Pitch270,
}

impl Rotation {
    /// (roll, pitch, yaw) in degrees
    pub fn euler_deg(&self) -> (f64, f64, f64) {
        match self {
            Rotation::None => (0.0, 0.0, 0.0),
            Rotation::Yaw45 => (0.0, 0.0, 45.0),
            Rotation::Yaw90 => (0.0, 0.0, 90.0),
            Rotation::Yaw135 => (0.0, 0.0, 135.0),
            Rotation::Yaw180 => (0.0, 0.0, 180.0),
            Rotation::Yaw225 => (0.0, 0.0, 225.0),
            Rotation::Yaw270 => (0.0, 0.0, 270.0),
            Rotation::Yaw315 => (0.0, 0.0, 315.0),
            Rotation::Roll180 => (180.0, 0.0, 0.0),
            Rotation::Roll180Yaw45 => (180.0, 0.0, 45.0),
            Rotation::Roll180Yaw90 => (180.0, 0.0, 90.0),
            Rotation::Roll180Yaw135 => (180.0, 0.0, 135.0),
            Rotation::Pitch180 => (0.0, 180.0, 0.0),
            Rotation::Roll180Yaw225 => (180.0, 0.0, 225.0),
            Rotation::Roll180Yaw270 => (180.0, 0.0, 270.0),
            Rotation::Roll180Yaw315 => (180.0, 0.0, 315.0),
            Rotation::Roll90 => (90.0, 0.0, 0.0),
            Rotation::Roll270 => (270.0, 0.0, 0.0),
            Rotation::Pitch90 => (0.0, 90.0, 0.0),
            Rotation::Pitch270 => (0.0, 270.0, 0.0),
        }
    }

    pub fn matrix(&self) -> Mat3 {
        let (r, p, y) = self.euler_deg();
        *Rotation3::from_euler_angles(r.to_radians(), p.to_radians(), y.to_radians()).matrix()
    }

    pub fn rotate(&self, v: &Vec3) -> Vec3 {
        match self {
            Rotation::None => *v,
            _ => self.matrix() * v,
        }
    }

    /// Undo the rotation (body frame back to sensor frame)
    pub fn rotate_inverse(&self, v: &Vec3) -> Vec3 {
        match self {
            Rotation::None => *v,
            _ => self.matrix().transpose() * v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_yaw90_maps_x_to_y() {
        let v = Rotation::Yaw90.rotate(&Vec3::new(1.0, 0.0, 0.0));
        assert_abs_diff_eq!(v, Vec3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_roll180_flips_y_and_z() {
        let v = Rotation::Roll180.rotate(&Vec3::new(1.0, 2.0, 3.0));
        assert_abs_diff_eq!(v, Vec3::new(1.0, -2.0, -3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_pitch90_moves_z_into_x() {
        let v = Rotation::Pitch90.rotate(&Vec3::new(0.0, 0.0, 1.0));
        assert_abs_diff_eq!(v, Vec3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_preserves_norm_and_inverts() {
        let v = Vec3::new(0.3, -9.7, 1.2);
        for rot in [Rotation::Yaw45, Rotation::Roll180Yaw315, Rotation::Pitch270] {
            let r = rot.rotate(&v);
            assert_abs_diff_eq!(r.norm(), v.norm(), epsilon = 1e-12);
            assert_abs_diff_eq!(rot.rotate_inverse(&r), v, epsilon = 1e-12);
        }
    }
}
