//! Loading and saving calibration through the parameter store.
//!
//! Values are read once at init. They are written back only when a
//! calibration is accepted or a save is forced.

use super::InertialSensor;
use crate::calibration::TempCalibration;
use crate::error::InsResult;
use crate::params;
use crate::types::{SensorKind, Vec3, MAX_INSTANCES};

impl InertialSensor {
    pub(super) fn load_saved_ids(&mut self) {
        let store = self.params.as_ref();
        let read = |key: String| store.get(&key).filter(|v| *v > 0.0).map(|v| v as u32);
        let accel_ids = std::array::from_fn(|i| read(params::accel_id_key(i)));
        let gyro_ids = std::array::from_fn(|i| read(params::gyro_id_key(i)));
        self.registry.set_saved_ids(SensorKind::Accel, accel_ids);
        self.registry.set_saved_ids(SensorKind::Gyro, gyro_ids);
    }

    /// Offsets, scales, temperature calibration, positions and trim
    pub(super) fn load_calibration(&mut self) {
        let store = self.params.as_ref();
        for (i, slot) in self.registry.iter(SensorKind::Accel) {
            let Some(ch) = self.accels[i].as_mut() else {
                continue;
            };
            let offset = store.get_vec3(&params::accel_offset_prefix(i));
            if let Some(offset) = offset {
                ch.cal.offset = offset;
            }
            if let Some(scale) = store.get_vec3(&params::accel_scale_prefix(i)) {
                if scale.iter().all(|s| *s > 0.0) {
                    ch.cal.scale = scale;
                }
            }
            ch.cal.cal_temp = store.get(&params::accel_cal_temp_key(i));
            ch.tcal = TempCalibration::load(store, i);
            self.accel_cal_ok[i] = slot.id_matched && offset.is_some();
            if offset.is_some() && !slot.id_matched {
                log::warn!("accel {}: saved calibration belongs to a different sensor", i);
            }
        }
        for (i, _) in self.registry.iter(SensorKind::Gyro) {
            let Some(ch) = self.gyros[i].as_mut() else {
                continue;
            };
            if let Some(offset) = store.get_vec3(&params::gyro_offset_prefix(i)) {
                ch.cal.offset = offset;
            }
            ch.cal.cal_temp = store.get(&params::gyro_cal_temp_key(i));
            ch.tcal = TempCalibration::load(store, i);
            self.gyro_cal_ok[i] = true;
        }
        for i in 0..MAX_INSTANCES {
            self.positions[i] = store
                .get_vec3(&params::position_prefix(i))
                .unwrap_or_else(Vec3::zeros);
        }
        self.trim = Vec3::new(
            store.get_or(params::TRIM_X, 0.0),
            store.get_or(params::TRIM_Y, 0.0),
            0.0,
        );
    }

    fn write_accel_calibration(&mut self) {
        let store = self.params.as_mut();
        for (i, slot) in self.registry.iter(SensorKind::Accel) {
            let Some(ch) = self.accels[i].as_ref() else {
                continue;
            };
            store.set_vec3(&params::accel_offset_prefix(i), &ch.cal.offset);
            store.set_vec3(&params::accel_scale_prefix(i), &ch.cal.scale);
            store.set(&params::accel_id_key(i), slot.persistent_id as f64);
            if let Some(t) = ch.cal.cal_temp {
                store.set(&params::accel_cal_temp_key(i), t);
            }
        }
        store.set(params::TRIM_X, self.trim.x);
        store.set(params::TRIM_Y, self.trim.y);
    }

    fn write_gyro_calibration(&mut self) {
        let store = self.params.as_mut();
        for (i, slot) in self.registry.iter(SensorKind::Gyro) {
            let Some(ch) = self.gyros[i].as_ref() else {
                continue;
            };
            store.set_vec3(&params::gyro_offset_prefix(i), &ch.cal.offset);
            store.set(&params::gyro_id_key(i), slot.persistent_id as f64);
            if let Some(t) = ch.cal.cal_temp {
                store.set(&params::gyro_cal_temp_key(i), t);
            }
        }
    }

    pub(super) fn save_accel_calibration(&mut self) -> InsResult<()> {
        self.write_accel_calibration();
        self.params.save()?;
        log::info!("accel calibration saved");
        Ok(())
    }

    pub(super) fn save_gyro_calibration(&mut self) -> InsResult<()> {
        self.write_gyro_calibration();
        self.params.save()?;
        log::info!("gyro calibration saved");
        Ok(())
    }

    pub(super) fn save_trim(&mut self) -> InsResult<()> {
        self.params.set(params::TRIM_X, self.trim.x);
        self.params.set(params::TRIM_Y, self.trim.y);
        self.params.save()
    }

    /// Write every calibration value, the sensor ids and the filter settings
    pub fn force_save_calibration(&mut self) -> InsResult<()> {
        self.write_accel_calibration();
        self.write_gyro_calibration();
        for i in 0..MAX_INSTANCES {
            if self.positions[i] != Vec3::zeros() {
                self.params.set_vec3(&params::position_prefix(i), &self.positions[i]);
            }
        }
        self.config.write_params(self.params.as_mut());
        self.params.save()?;
        log::info!("calibration and filter settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::backend::SimImuConfig;
    use crate::params::{MemoryParamStore, ParamStore};
    use crate::types::Vec3;
    use approx::assert_abs_diff_eq;

    fn saved_store(accel_id: u32) -> MemoryParamStore {
        let mut store = MemoryParamStore::new();
        store.set("INS_ACC_ID", accel_id as f64);
        store.set_vec3("INS_ACCOFFS", &Vec3::new(0.1, -0.2, 0.3));
        store.set_vec3("INS_ACCSCAL", &Vec3::new(1.01, 0.99, 1.0));
        store.set_vec3("INS_GYROFFS", &Vec3::new(0.001, 0.002, -0.003));
        store.set_vec3("INS_POS1", &Vec3::new(0.05, 0.0, -0.02));
        store.set("AHRS_TRIM_X", 0.01);
        store.set("INS_GYRO_FILTER", 30.0);
        store
    }

    #[test]
    fn test_saved_calibration_loaded_at_init() {
        let id = SimImuConfig::new(1000.0, 1).accel_id;
        let rig = rig_with(1, 1000.0, quiet_config(), saved_store(id), |_, _| {});
        let cal = rig.ins.accel_calibration(0).unwrap();
        assert_abs_diff_eq!(cal.offset, Vec3::new(0.1, -0.2, 0.3), epsilon = 1e-12);
        assert_abs_diff_eq!(cal.scale, Vec3::new(1.01, 0.99, 1.0), epsilon = 1e-12);
        let gyro = rig.ins.gyro_calibration(0).unwrap();
        assert_abs_diff_eq!(gyro.offset, Vec3::new(0.001, 0.002, -0.003), epsilon = 1e-12);
        assert!(rig.ins.accel_cal_ok(0));
        assert_eq!(rig.ins.imu_position(0), Vec3::new(0.05, 0.0, -0.02));
        assert_eq!(rig.ins.trim().x, 0.01);
        assert_eq!(rig.ins.config().gyro_filter_hz, 30.0);
    }

    #[test]
    fn test_calibration_for_other_sensor_flagged() {
        let rig = rig_with(1, 1000.0, quiet_config(), saved_store(999), |_, _| {});
        assert!(!rig.ins.accel_cal_ok(0));
        assert!(!rig.ins.registry().slot(crate::types::SensorKind::Accel, 0).unwrap().id_matched);
    }

    #[test]
    fn test_nothing_written_until_forced_save() {
        let mut rig = rig(1, 1000.0);
        rig.run(50);
        assert_eq!(rig.ins.params().get("INS_ACCOFFS_X"), None);
        rig.ins.force_save_calibration().unwrap();
        let params = rig.ins.params();
        assert_eq!(params.get("INS_ACCOFFS_X"), Some(0.0));
        assert_eq!(params.get("INS_ACCSCAL_Y"), Some(1.0));
        assert_eq!(params.get("INS_GYROFFS_Z"), Some(0.0));
        assert_eq!(params.get("INS_ACC_ID"), Some(SimImuConfig::new(1000.0, 1).accel_id as f64));
        assert_eq!(params.get("INS_GYRO_FILTER"), Some(20.0));
    }
}
