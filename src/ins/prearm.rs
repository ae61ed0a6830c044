use super::InertialSensor;
use crate::error::PreArmFailure;
use crate::types::SensorKind;

impl InertialSensor {
    /// Everything that should stop the vehicle arming right now
    pub fn pre_arm_checks(&self) -> Vec<PreArmFailure> {
        let mut failures = Vec::new();
        let snap = &self.snapshot;
        if snap.accel_present.is_empty() && snap.gyro_present.is_empty() {
            failures.push(PreArmFailure::NoSensors);
            return failures;
        }

        let loop_rate_hz = self.config.loop_rate_hz;
        for kind in [SensorKind::Accel, SensorKind::Gyro] {
            for (instance, slot) in self.registry.iter(kind).filter(|(_, s)| s.rate_mismatch) {
                failures.push(PreArmFailure::RateMismatch {
                    kind,
                    instance,
                    raw_rate_hz: slot.raw_rate_hz,
                    loop_rate_hz,
                });
            }
        }

        for (kind, present, healthy) in [
            (SensorKind::Accel, snap.accel_present, snap.accel_healthy),
            (SensorKind::Gyro, snap.gyro_present, snap.gyro_healthy),
        ] {
            for instance in present.difference(healthy).iter() {
                failures.push(PreArmFailure::Unhealthy { kind, instance });
            }
        }

        let window_ms = self.config.consistency.window_ms;
        if snap.accel_healthy.len() > 1 && !self.accels_consistent_for(window_ms) {
            failures.push(PreArmFailure::AccelsInconsistent);
        }
        if snap.gyro_healthy.len() > 1 && !self.gyros_consistent_for(window_ms) {
            failures.push(PreArmFailure::GyrosInconsistent);
        }

        for i in snap.gyro_present.iter().filter(|i| !self.gyro_cal_ok[*i]) {
            failures.push(PreArmFailure::GyroNotCalibrated(i));
        }
        for i in snap.accel_present.iter().filter(|i| !self.accel_cal_ok[*i]) {
            failures.push(PreArmFailure::AccelNotCalibrated(i));
        }
        if self.reboot_required {
            failures.push(PreArmFailure::RebootRequired);
        }

        let nyquist_hz = 0.5 * loop_rate_hz;
        for (notch, cfg) in self.config.notches.iter().enumerate() {
            for (harmonic, freq_hz) in cfg.harmonics_above(nyquist_hz) {
                failures.push(PreArmFailure::NotchAboveNyquist {
                    notch,
                    harmonic,
                    freq_hz,
                });
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::error::PreArmFailure;
    use crate::filters::HarmonicNotchConfig;
    use crate::params::{MemoryParamStore, ParamStore};
    use crate::types::{SensorKind, Vec3};

    fn calibrated_store(imus: usize) -> MemoryParamStore {
        let mut store = MemoryParamStore::new();
        for i in 0..imus {
            let id = crate::backend::SimImuConfig::new(1000.0, i as u64 + 1).accel_id;
            store.set(&crate::params::accel_id_key(i), id as f64);
            store.set_vec3(&crate::params::accel_offset_prefix(i), &Vec3::zeros());
        }
        store
    }

    #[test]
    fn test_no_sensors() {
        let rig = rig(0, 1000.0);
        assert_eq!(rig.ins.pre_arm_checks(), vec![PreArmFailure::NoSensors]);
    }

    #[test]
    fn test_clean_system_passes_after_consistency_window() {
        let mut config = quiet_config();
        config.consistency.window_ms = 200;
        let mut rig = rig_with(2, 1200.0, config, calibrated_store(2), |_, _| {});
        rig.run(10);
        assert_eq!(
            rig.ins.pre_arm_checks(),
            vec![PreArmFailure::AccelsInconsistent, PreArmFailure::GyrosInconsistent]
        );
        rig.run(100);
        assert!(rig.ins.pre_arm_checks().is_empty(), "{:?}", rig.ins.pre_arm_checks());
    }

    #[test]
    fn test_uncalibrated_and_mismatched_sensors_reported() {
        let mut rig = rig(1, 1000.0);
        rig.run(10);
        let failures = rig.ins.pre_arm_checks();
        assert!(failures.contains(&PreArmFailure::AccelNotCalibrated(0)));
        assert!(failures.contains(&PreArmFailure::RateMismatch {
            kind: SensorKind::Gyro,
            instance: 0,
            raw_rate_hz: 1000.0,
            loop_rate_hz: 400.0,
        }));
        let message = failures[0].to_string();
        assert!(message.contains("does not divide"), "{message}");
    }

    #[test]
    fn test_dead_sensor_blocks_arming() {
        let mut rig = rig_with(1, 1200.0, quiet_config(), calibrated_store(1), |_, _| {});
        rig.run(10);
        rig.controls[0].kill(true);
        rig.run(5);
        let failures = rig.ins.pre_arm_checks();
        assert!(failures.contains(&PreArmFailure::Unhealthy {
            kind: SensorKind::Accel,
            instance: 0
        }));
        assert!(failures.contains(&PreArmFailure::Unhealthy {
            kind: SensorKind::Gyro,
            instance: 0
        }));
    }

    #[test]
    fn test_notch_harmonic_above_nyquist() {
        let mut config = quiet_config();
        config.notches = vec![HarmonicNotchConfig {
            enabled: true,
            center_hz: 150.0,
            harmonics: 0b11,
            ..HarmonicNotchConfig::new()
        }];
        let rig = rig_with(1, 1200.0, config, calibrated_store(1), |_, _| {});
        let failures = rig.ins.pre_arm_checks();
        assert!(failures.contains(&PreArmFailure::NotchAboveNyquist {
            notch: 0,
            harmonic: 2,
            freq_hz: 300.0,
        }));
        assert!(!failures
            .iter()
            .any(|f| matches!(f, PreArmFailure::NotchAboveNyquist { harmonic: 1, .. })));
    }
}
