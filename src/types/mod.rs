pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of accelerometer (and gyroscope) instances
pub const MAX_INSTANCES: usize = 3;

/// Which half of an IMU an instance belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Accel,
    Gyro,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Accel => write!(f, "accel"),
            SensorKind::Gyro => write!(f, "gyro"),
        }
    }
}

/// Integral of a sensor quantity supplied directly by a backend
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Delta {
    /// Delta-angle (rad) or delta-velocity (m/s)
    pub value: Vec3,
    /// Integration time in seconds
    pub dt: f64,
}

/// One timestamped sample as pushed by a backend
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawSample {
    pub timestamp_us: u64,
    /// m/s² for accels, rad/s for gyros, in the sensor's own frame
    pub vector: Vec3,
    /// Degrees Celsius
    pub temperature: f64,
    pub delta: Option<Delta>,
}

impl RawSample {
    pub fn new(timestamp_us: u64, vector: Vec3, temperature: f64) -> Self {
        Self {
            timestamp_us,
            vector,
            temperature,
            delta: None,
        }
    }

    pub fn with_delta(mut self, delta: Delta) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn is_valid(&self) -> bool {
        is_finite(&self.vector)
            && self.temperature.is_finite()
            && self
                .delta
                .map_or(true, |d| is_finite(&d.value) && d.dt.is_finite() && d.dt >= 0.0)
    }
}

/// Axis label used by parameter keys and records
pub const AXES: [&str; 3] = ["X", "Y", "Z"];
