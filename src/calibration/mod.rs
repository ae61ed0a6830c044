//! Calibration engine: accelerometer fits, gyro bias, trim and temperature
//! compensation.
//!
//! Routines never touch the published snapshot. They read uncalibrated data
//! from a [`RawTap`] that `update()` fills and `periodic()` or the blocking
//! calibration loops drain.

pub mod accel;
pub mod gyro;
pub mod session;
pub mod tempcal;
pub mod trim;

use crate::types::{Vec3, MAX_INSTANCES};
use serde::{Deserialize, Serialize};

pub use accel::{AccelCalParams, AccelCalStatus, AccelCalibrator, FitModel, FitOutcome};
pub use gyro::{GyroCalState, GyroCalibrator};
pub use session::AccelCalSession;
pub use tempcal::TempCalibration;
pub use trim::calculate_trim;

/// Offset and scale in use for one accelerometer
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccelCalibration {
    pub offset: Vec3,
    pub scale: Vec3,
    /// Temperature the offsets were calibrated at
    pub cal_temp: Option<f64>,
}

impl AccelCalibration {
    pub fn apply(&self, raw: &Vec3) -> Vec3 {
        (raw - self.offset).component_mul(&self.scale)
    }
}

impl Default for AccelCalibration {
    fn default() -> Self {
        Self {
            offset: Vec3::zeros(),
            scale: Vec3::new(1.0, 1.0, 1.0),
            cal_temp: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GyroCalibration {
    pub offset: Vec3,
    pub cal_temp: Option<f64>,
}

impl GyroCalibration {
    pub fn apply(&self, raw: &Vec3) -> Vec3 {
        raw - self.offset
    }
}

impl Default for GyroCalibration {
    fn default() -> Self {
        Self {
            offset: Vec3::zeros(),
            cal_temp: None,
        }
    }
}

/// Running sums of uncalibrated samples for one instance
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TapChannel {
    pub count: u32,
    sum: Vec3,
    sum_sq: Vec3,
    /// Integral of the value over `dt`
    integral: Vec3,
    dt: f64,
    temp_sum: f64,
}

impl TapChannel {
    pub fn add(&mut self, value: &Vec3, dt: f64, temperature: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value.component_mul(value);
        self.integral += value * dt;
        self.dt += dt;
        self.temp_sum += temperature;
    }

    pub fn mean(&self) -> Option<Vec3> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Per-axis population standard deviation
    pub fn std_dev(&self) -> Option<Vec3> {
        let mean = self.mean()?;
        let n = self.count as f64;
        Some((self.sum_sq / n - mean.component_mul(&mean)).map(|v| v.max(0.0).sqrt()))
    }

    pub fn integral(&self) -> Vec3 {
        self.integral
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn mean_temperature(&self) -> Option<f64> {
        (self.count > 0).then(|| self.temp_sum / self.count as f64)
    }

    pub fn merge(&mut self, other: &TapChannel) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.integral += other.integral;
        self.dt += other.dt;
        self.temp_sum += other.temp_sum;
    }
}

/// Uncalibrated accumulations for every instance since the last drain
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawTap {
    pub accel: [TapChannel; MAX_INSTANCES],
    pub gyro: [TapChannel; MAX_INSTANCES],
}

impl RawTap {
    pub fn take(&mut self) -> RawTap {
        std::mem::take(self)
    }

    pub fn merge(&mut self, other: &RawTap) {
        for i in 0..MAX_INSTANCES {
            self.accel[i].merge(&other.accel[i]);
            self.gyro[i].merge(&other.gyro[i]);
        }
    }
}
