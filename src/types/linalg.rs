//! Linear algebra type system for the inertial sensor core
//!
//! Fixed-size aliases for sensor vectors and frames, plus the dynamic
//! shapes the calibration solver works in.

use nalgebra::{DMatrix, DVector, SMatrix, SVector};

// ===== Sensor Frames =====
pub type Vec3 = SVector<f64, 3>;
pub type Mat3 = SMatrix<f64, 3, 3>;

// ===== Calibration Fit Dimensions =====
pub const SPHERE_PARAMS: usize = 6; // offset + diagonal scale
pub const ELLIPSOID_PARAMS: usize = 9; // + symmetric cross-axis terms

// Gauss-Newton shapes (rows = samples, cols = fit parameters)
pub type FitJacobian = DMatrix<f64>;
pub type FitResiduals = DVector<f64>;
pub type FitParams = DVector<f64>;

/// Standard gravity in m/s²
pub const GRAVITY_MSS: f64 = 9.80665;

/// Array form used by serialized records
pub fn to_array(v: &Vec3) -> [f64; 3] {
    [v.x, v.y, v.z]
}

pub fn from_array(a: [f64; 3]) -> Vec3 {
    Vec3::new(a[0], a[1], a[2])
}

/// True when every component is finite
pub fn is_finite(v: &Vec3) -> bool {
    v.iter().all(|c| c.is_finite())
}
