use crate::params::{self, ParamStore};
use crate::types::Vec3;
use serde::{Deserialize, Serialize};

/// Third-order temperature compensation for one IMU.
///
/// Coefficients describe the sensor error as a polynomial in the distance
/// from the middle of the calibrated range. Corrections move a reading to
/// what it would have been at the temperature the offsets were taken at.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TempCalibration {
    pub enabled: bool,
    pub temp_min: f64,
    pub temp_max: f64,
    pub accel_coeff: [Vec3; 3],
    pub gyro_coeff: [Vec3; 3],
}

impl Default for TempCalibration {
    fn default() -> Self {
        Self {
            enabled: false,
            temp_min: 0.0,
            temp_max: 0.0,
            accel_coeff: [Vec3::zeros(); 3],
            gyro_coeff: [Vec3::zeros(); 3],
        }
    }
}

fn polynomial(coeff: &[Vec3; 3], tdiff: f64) -> Vec3 {
    (coeff[0] + (coeff[1] + coeff[2] * tdiff) * tdiff) * tdiff
}

impl TempCalibration {
    fn mid(&self) -> f64 {
        0.5 * (self.temp_min + self.temp_max)
    }

    fn correct(&self, coeff: &[Vec3; 3], temperature: f64, cal_temp: Option<f64>, v: &mut Vec3) {
        if !self.enabled || self.temp_max <= self.temp_min || !temperature.is_finite() {
            return;
        }
        let tmid = self.mid();
        let temperature = temperature.clamp(self.temp_min, self.temp_max);
        let cal_temp = cal_temp.unwrap_or(tmid).clamp(self.temp_min, self.temp_max);
        *v -= polynomial(coeff, temperature - tmid);
        *v += polynomial(coeff, cal_temp - tmid);
    }

    pub fn correct_accel(&self, temperature: f64, cal_temp: Option<f64>, v: &mut Vec3) {
        self.correct(&self.accel_coeff, temperature, cal_temp, v);
    }

    pub fn correct_gyro(&self, temperature: f64, cal_temp: Option<f64>, v: &mut Vec3) {
        self.correct(&self.gyro_coeff, temperature, cal_temp, v);
    }

    /// Read `INS_TCALn_*` for IMU `instance`; absent keys leave it disabled
    pub fn load(store: &dyn ParamStore, instance: usize) -> Self {
        let prefix = params::tcal_prefix(instance);
        let mut tcal = Self {
            enabled: store.get_or(&format!("{prefix}_ENABLE"), 0.0) != 0.0,
            temp_min: store.get_or(&format!("{prefix}_TMIN"), 0.0),
            temp_max: store.get_or(&format!("{prefix}_TMAX"), 0.0),
            ..Self::default()
        };
        for order in 0..3 {
            if let Some(c) = store.get_vec3(&format!("{prefix}_ACC{}", order + 1)) {
                tcal.accel_coeff[order] = c;
            }
            if let Some(c) = store.get_vec3(&format!("{prefix}_GYR{}", order + 1)) {
                tcal.gyro_coeff[order] = c;
            }
        }
        tcal
    }

    pub fn write(&self, store: &mut dyn ParamStore, instance: usize) {
        let prefix = params::tcal_prefix(instance);
        store.set(&format!("{prefix}_ENABLE"), if self.enabled { 1.0 } else { 0.0 });
        store.set(&format!("{prefix}_TMIN"), self.temp_min);
        store.set(&format!("{prefix}_TMAX"), self.temp_max);
        for order in 0..3 {
            store.set_vec3(&format!("{prefix}_ACC{}", order + 1), &self.accel_coeff[order]);
            store.set_vec3(&format!("{prefix}_GYR{}", order + 1), &self.gyro_coeff[order]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MemoryParamStore;
    use approx::assert_abs_diff_eq;

    fn linear_drift() -> TempCalibration {
        TempCalibration {
            enabled: true,
            temp_min: 10.0,
            temp_max: 50.0,
            accel_coeff: [Vec3::new(0.01, 0.0, -0.02), Vec3::zeros(), Vec3::zeros()],
            gyro_coeff: [Vec3::new(0.001, 0.0, 0.0), Vec3::zeros(), Vec3::zeros()],
        }
    }

    #[test]
    fn test_polynomial_evaluation() {
        let coeff = [Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.5, 0.0, 0.0), Vec3::new(0.25, 0.0, 0.0)];
        // (1 + (0.5 + 0.25*2)*2)*2 = 6
        assert_abs_diff_eq!(polynomial(&coeff, 2.0).x, 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_corrects_to_calibration_temperature() {
        let tcal = linear_drift();
        // Sensor reads truth plus 0.01*(T - 30) on x
        let truth = Vec3::new(0.0, 0.0, -9.8);
        let at = |t: f64| truth + Vec3::new(0.01, 0.0, -0.02) * (t - 30.0);

        let mut v = at(45.0);
        tcal.correct_accel(45.0, Some(20.0), &mut v);
        assert_abs_diff_eq!(v, at(20.0), epsilon = 1e-12);
    }

    #[test]
    fn test_temperature_clamped_to_range() {
        let tcal = linear_drift();
        let mut hot = Vec3::zeros();
        let mut edge = Vec3::zeros();
        tcal.correct_gyro(90.0, Some(30.0), &mut hot);
        tcal.correct_gyro(50.0, Some(30.0), &mut edge);
        assert_abs_diff_eq!(hot, edge, epsilon = 1e-12);
    }

    #[test]
    fn test_disabled_leaves_vector() {
        let tcal = TempCalibration::default();
        let mut v = Vec3::new(1.0, 2.0, 3.0);
        tcal.correct_accel(40.0, Some(20.0), &mut v);
        assert_eq!(v, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_params_round_trip() {
        let mut store = MemoryParamStore::new();
        linear_drift().write(&mut store, 1);
        assert_eq!(store.get("INS_TCAL2_TMAX"), Some(50.0));
        assert_eq!(TempCalibration::load(&store, 1), linear_drift());
        assert!(!TempCalibration::load(&store, 0).enabled);
    }
}
