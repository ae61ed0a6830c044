//! Operator-driven calibration: accel sessions, gyro bias and trim.
//!
//! Accel calibration is cooperative. The session is fed from `periodic()`
//! while the loop keeps running. Gyro and trim calibration drive the loop
//! themselves until they finish.

use super::InertialSensor;
use crate::calibration::{calculate_trim, AccelCalSession, AccelCalibration, GyroCalState, GyroCalibrator, RawTap};
use crate::error::{CalFailure, CalResult, InsResult};
use crate::types::{SensorKind, Vec3, MAX_INSTANCES};

impl InertialSensor {
    /// An accel calibration session is collecting or waiting for the operator
    pub fn calibrating(&self) -> bool {
        let now_ms = self.clock.now_ms();
        self.accel_cal
            .as_ref()
            .map_or(false, |s| s.status(now_ms) == CalResult::InProgress)
    }

    pub fn start_accel_cal(&mut self) -> CalResult {
        if self.calibrating() {
            return CalResult::Failed(CalFailure::Busy);
        }
        let accels = self.registry.present(SensorKind::Accel);
        if !self.initialised || accels.is_empty() {
            return CalResult::Failed(CalFailure::NoSensor);
        }
        let now_ms = self.clock.now_ms();
        let session = AccelCalSession::new(&self.config.accel_cal, accels, self.snapshot.first_usable_accel, now_ms);
        log::info!(
            "accel calibration started on {} instance(s), {} positions",
            accels.len(),
            session.positions()
        );
        self.accel_cal = Some(session);
        self.accel_cal_reported = Some(CalResult::InProgress);
        CalResult::InProgress
    }

    /// Vehicle placed in the next orientation
    pub fn accel_cal_step(&mut self) -> CalResult {
        let now_ms = self.clock.now_ms();
        let Some(session) = self.accel_cal.as_mut() else {
            return self.ended_accel_cal_status();
        };
        let status = session.status(now_ms);
        if let CalResult::Failed(failure) = status {
            log::warn!("accel calibration failed: {}", failure);
            self.end_failed_accel_cal(status);
            return status;
        }
        if !session.waiting_for_orientation() {
            return status;
        }
        // Samples taken while the vehicle was being moved must not count
        self.tap = RawTap::default();
        let result = session.step(now_ms);
        log::info!("accel calibration position {} of {}", session.steps(), session.positions());
        result
    }

    pub fn accel_cal_status(&self) -> CalResult {
        match self.accel_cal.as_ref() {
            Some(session) => session.status(self.clock.now_ms()),
            None => self.ended_accel_cal_status(),
        }
    }

    /// Failure that ended the last session, if it was not aborted or
    /// accepted
    fn ended_accel_cal_status(&self) -> CalResult {
        match self.accel_cal_reported {
            Some(status @ CalResult::Failed(_)) => status,
            _ => CalResult::Failed(CalFailure::NoSession),
        }
    }

    fn end_failed_accel_cal(&mut self, status: CalResult) {
        self.accel_cal = None;
        self.accel_cal_reported = Some(status);
    }

    /// Positions collected so far and positions required
    pub fn accel_cal_progress(&self) -> Option<(usize, usize)> {
        self.accel_cal.as_ref().map(|s| (s.collected(), s.positions()))
    }

    /// Drop the session; the calibration in use is left as it was
    pub fn accel_cal_abort(&mut self) -> CalResult {
        if self.accel_cal.take().is_some() {
            log::info!("accel calibration aborted");
        }
        self.accel_cal_reported = None;
        CalResult::Failed(CalFailure::Aborted)
    }

    /// Apply and save a successful session. Anything else is returned
    /// unchanged and leaves the calibration in use untouched.
    pub fn accel_cal_accept(&mut self) -> InsResult<CalResult> {
        let status = self.accel_cal_status();
        if status != CalResult::Success {
            return Ok(status);
        }
        let Some(session) = self.accel_cal.take() else {
            return Ok(CalResult::Failed(CalFailure::NoSession));
        };
        let Some(results) = session.results() else {
            return Ok(CalResult::Failed(CalFailure::NoSession));
        };

        let board = self.config.board_orientation;
        let new_trim = match session.level_sample().map(|s| calculate_trim(&board.rotate(&s))) {
            Some(Ok(trim)) => Some(trim),
            Some(Err(failure)) => {
                log::warn!("accel calibration rejected: {}", failure);
                return Ok(CalResult::Failed(failure));
            }
            None => None,
        };

        for (i, outcome) in results.iter().enumerate() {
            let (Some(outcome), Some(ch)) = (outcome, self.accels[i].as_mut()) else {
                continue;
            };
            let cal_temp = session.collection_temperature(i).unwrap_or(ch.temperature);
            if outcome.params.offdiag != Vec3::zeros() {
                log::debug!("accel {}: cross-axis terms {:?} not applied", i, outcome.params.offdiag);
            }
            ch.cal = AccelCalibration {
                offset: outcome.params.offset,
                scale: outcome.params.diag,
                cal_temp: Some(cal_temp),
            };
            self.accel_cal_ok[i] = true;
            log::info!(
                "accel {}: offset {:?} scale {:?} fitness {:.3}",
                i,
                outcome.params.offset.as_slice(),
                outcome.params.diag.as_slice(),
                outcome.fitness
            );
        }
        if let Some(trim) = new_trim {
            self.trim = trim;
            self.new_trim = Some(trim);
        }
        self.accel_cal_reported = None;
        self.save_accel_calibration()?;

        if self.config.accel_cal_requires_reboot {
            self.reboot_required = true;
            return Ok(CalResult::RequiresReboot);
        }
        Ok(CalResult::Success)
    }

    /// Feed the drained tap to the session and solve finished instances
    pub(super) fn progress_accel_cal(&mut self, tap: &RawTap, now_ms: u64) {
        let prior: [AccelCalibration; MAX_INSTANCES] =
            std::array::from_fn(|i| self.accels[i].as_ref().map(|c| c.cal).unwrap_or_default());
        let max_abs: [f64; MAX_INSTANCES] = std::array::from_fn(|i| {
            self.registry
                .slot(SensorKind::Accel, i)
                .map_or(0.0, |s| s.max_abs_offset)
        });
        let Some(session) = self.accel_cal.as_mut() else {
            return;
        };
        let before = session.collected();
        session.feed(tap);
        if session.collected() > before {
            log::info!("accel calibration sample {} of {} taken", session.collected(), session.positions());
        }
        if session.run_fits(&prior, &max_abs) > 0 {
            log::debug!("accel calibration fit run");
        }
        let status = session.status(now_ms);
        if self.accel_cal_reported != Some(status) {
            match status {
                CalResult::Success => log::info!("accel calibration complete, waiting for accept"),
                CalResult::Failed(failure) => log::warn!("accel calibration failed: {}", failure),
                _ => {}
            }
            self.accel_cal_reported = Some(status);
        }
        if matches!(status, CalResult::Failed(_)) {
            self.end_failed_accel_cal(status);
        }
    }

    /// Estimate every gyro's bias while the vehicle is held still. Instances
    /// that do not converge keep the offsets they had.
    pub fn calibrate_gyros(&mut self) -> CalResult {
        let gyros = self.registry.present(SensorKind::Gyro);
        if !self.initialised || gyros.is_empty() {
            return CalResult::Failed(CalFailure::NoSensor);
        }
        if self.calibrating() {
            return CalResult::Failed(CalFailure::Busy);
        }
        let cfg = self.config.gyro_cal.clone();
        let mut calibrators: [Option<GyroCalibrator>; MAX_INSTANCES] =
            std::array::from_fn(|i| gyros.contains(i).then(|| GyroCalibrator::new(&cfg)));
        log::info!("gyro calibration started, keep the vehicle still");

        self.tap = RawTap::default();
        for _ in 0..cfg.max_windows.max(2) {
            if calibrators.iter().flatten().all(|c| !c.is_running()) {
                break;
            }
            for _ in 0..cfg.window_cycles.max(1) {
                self.wait_for_sample();
                self.update();
            }
            let tap = self.tap.take();
            for (i, cal) in calibrators.iter_mut().enumerate() {
                if let Some(cal) = cal {
                    cal.add_window(&tap.gyro[i]);
                }
            }
        }

        let mut result = CalResult::Success;
        let mut converged = false;
        for (i, cal) in calibrators.iter().enumerate() {
            let (Some(cal), Some(ch)) = (cal, self.gyros[i].as_mut()) else {
                continue;
            };
            match cal.state() {
                GyroCalState::Converged(bias) => {
                    ch.cal.offset = bias;
                    ch.cal.cal_temp = cal.temperature();
                    self.gyro_cal_ok[i] = true;
                    converged = true;
                    log::info!("gyro {}: bias {:?}", i, bias.as_slice());
                }
                GyroCalState::Failed(failure) => {
                    self.gyro_cal_ok[i] = false;
                    log::warn!("gyro {} calibration failed: {}", i, failure);
                    if result == CalResult::Success {
                        result = CalResult::Failed(failure);
                    }
                }
                GyroCalState::Running => {
                    self.gyro_cal_ok[i] = false;
                    if result == CalResult::Success {
                        result = CalResult::Failed(CalFailure::Divergent);
                    }
                }
            }
        }
        if converged {
            if let Err(e) = self.save_gyro_calibration() {
                log::error!("failed to save gyro calibration: {}", e);
            }
        }
        result
    }

    /// Level the vehicle and derive roll/pitch trim from the first usable
    /// accel
    pub fn calibrate_trim(&mut self) -> CalResult {
        let Some(instance) = self.snapshot.first_usable_accel else {
            return CalResult::Failed(CalFailure::NoSensor);
        };
        if self.calibrating() {
            return CalResult::Failed(CalFailure::Busy);
        }
        self.tap = RawTap::default();
        for _ in 0..self.config.trim_cycles.max(1) {
            self.wait_for_sample();
            self.update();
        }
        let tap = self.tap.take();
        let ch = &tap.accel[instance];
        let (Some(mean), Some(sd)) = (ch.mean(), ch.std_dev()) else {
            return CalResult::Failed(CalFailure::NotEnoughSamples { have: 0, need: 1 });
        };
        if sd.max() > self.config.trim_still_mss {
            log::warn!("trim calibration: vehicle moving ({:.2} m/s²)", sd.max());
            return CalResult::Failed(CalFailure::NotStill);
        }
        let Some(channel) = self.accels[instance].as_ref() else {
            return CalResult::Failed(CalFailure::NoSensor);
        };
        let level = channel.board.rotate(&channel.cal.apply(&mean));
        match calculate_trim(&level) {
            Ok(trim) => {
                self.trim = trim;
                self.new_trim = Some(trim);
                log::info!(
                    "trim roll {:.2} deg pitch {:.2} deg",
                    trim.x.to_degrees(),
                    trim.y.to_degrees()
                );
                if let Err(e) = self.save_trim() {
                    log::error!("failed to save trim: {}", e);
                }
                CalResult::Success
            }
            Err(failure) => {
                log::warn!("trim calibration failed: {}", failure);
                CalResult::Failed(failure)
            }
        }
    }

    /// Trim from the last calibration, returned once
    pub fn take_new_trim(&mut self) -> Option<Vec3> {
        self.new_trim.take()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::calibration::accel::tests::six_positions;
    use crate::config::{GyroCalTiming, InsConfig};
    use crate::error::{CalFailure, CalResult, PreArmFailure};
    use crate::params::{MemoryParamStore, ParamStore};
    use crate::types::{Vec3, GRAVITY_MSS};
    use approx::assert_abs_diff_eq;

    fn run_six_positions(rig: &mut Rig) {
        for dir in six_positions() {
            for c in rig.controls.iter() {
                c.set_specific_force(dir * GRAVITY_MSS);
            }
            rig.run_with_periodic(10);
            assert_eq!(rig.ins.accel_cal_step(), CalResult::InProgress);
            rig.run_with_periodic(220);
        }
    }

    #[test]
    fn test_accel_cal_recovers_offset_and_scale() {
        let offset = Vec3::new(0.3, -0.2, 0.4);
        let scale = Vec3::new(1.02, 0.98, 1.01);
        let mut rig = rig_with(2, 1000.0, quiet_config(), MemoryParamStore::new(), |i, cfg| {
            if i == 0 {
                cfg.accel_offset = offset;
                cfg.accel_scale = scale;
            }
        });
        rig.run(20);
        assert_eq!(rig.ins.start_accel_cal(), CalResult::InProgress);
        assert!(rig.ins.calibrating());
        assert_eq!(rig.ins.start_accel_cal(), CalResult::Failed(CalFailure::Busy));

        run_six_positions(&mut rig);
        assert_eq!(rig.ins.accel_cal_progress(), Some((6, 6)));
        assert_eq!(rig.ins.accel_cal_status(), CalResult::Success);
        // Nothing applied before accept
        assert_eq!(rig.ins.accel_calibration(0).unwrap().offset, Vec3::zeros());

        assert_eq!(rig.ins.accel_cal_accept().unwrap(), CalResult::Success);
        let cal = rig.ins.accel_calibration(0).unwrap();
        assert_abs_diff_eq!(cal.offset, offset, epsilon = 0.05);
        assert_abs_diff_eq!(cal.scale, scale, epsilon = 0.01);
        assert_eq!(cal.cal_temp, Some(35.0));
        let clean = rig.ins.accel_calibration(1).unwrap();
        assert_abs_diff_eq!(clean.offset, Vec3::zeros(), epsilon = 0.05);
        assert!(rig.ins.accel_cal_ok(0) && rig.ins.accel_cal_ok(1));
        assert!(!rig.ins.calibrating());

        let params = rig.ins.params();
        assert!((params.get("INS_ACCOFFS_X").unwrap() - offset.x).abs() < 0.05);
        assert!(params.get("INS_ACC2SCAL_Z").is_some());

        let trim = rig.ins.take_new_trim().unwrap();
        assert!(trim.norm() < 0.01, "trim {trim}");
        assert_eq!(rig.ins.take_new_trim(), None);

        // Back level, the corrected reading is gravity
        for c in rig.controls.iter() {
            c.set_specific_force(six_positions()[0] * GRAVITY_MSS);
        }
        rig.run(200);
        assert!((rig.ins.accel(0).z + GRAVITY_MSS).abs() < 0.1);
    }

    #[test]
    fn test_offset_change_bound_rejects_and_keeps_prior() {
        let mut config = quiet_config();
        config.accel_cal.max_offset_change_mss = 0.5;
        let mut rig = rig_with(1, 1000.0, config, MemoryParamStore::new(), |_, cfg| {
            cfg.accel_offset = Vec3::new(1.0, 0.0, 0.0);
        });
        rig.run(10);
        rig.ins.start_accel_cal();
        run_six_positions(&mut rig);
        let status = rig.ins.accel_cal_status();
        assert!(
            matches!(status, CalResult::Failed(CalFailure::OffsetChangeExceeded { axis: 0, .. })),
            "{status:?}"
        );
        assert_eq!(rig.ins.accel_cal_accept().unwrap(), status);
        assert_eq!(rig.ins.accel_calibration(0).unwrap().offset, Vec3::zeros());
        assert_eq!(rig.ins.params().get("INS_ACCOFFS_X"), None);
        // A failed session no longer blocks a new one
        assert_eq!(rig.ins.start_accel_cal(), CalResult::InProgress);
    }

    #[test]
    fn test_abort_leaves_calibration_untouched() {
        let mut rig = rig(1, 1000.0);
        rig.run(10);
        rig.ins.start_accel_cal();
        rig.ins.accel_cal_step();
        rig.run_with_periodic(50);
        assert_eq!(rig.ins.accel_cal_abort(), CalResult::Failed(CalFailure::Aborted));
        assert!(!rig.ins.calibrating());
        assert_eq!(rig.ins.accel_cal_status(), CalResult::Failed(CalFailure::NoSession));
        assert_eq!(rig.ins.accel_calibration(0).unwrap().offset, Vec3::zeros());
    }

    #[test]
    fn test_repeated_orientation_fails_session() {
        let mut rig = rig(1, 1000.0);
        rig.run(10);
        rig.ins.start_accel_cal();
        for _ in 0..2 {
            rig.ins.accel_cal_step();
            rig.run_with_periodic(220);
        }
        assert_eq!(rig.ins.accel_cal_status(), CalResult::Failed(CalFailure::SampleTooClose));
    }

    #[test]
    fn test_operator_timeout() {
        let mut config = quiet_config();
        config.accel_cal.timeout_s = 1.0;
        let mut rig = rig_with(1, 1000.0, config, MemoryParamStore::new(), |_, _| {});
        rig.ins.start_accel_cal();
        rig.run_with_periodic(500);
        assert_eq!(rig.ins.accel_cal_status(), CalResult::Failed(CalFailure::Timeout));
        assert!(!rig.ins.calibrating());
    }

    #[test]
    fn test_timed_out_session_cannot_be_resumed() {
        let mut config = quiet_config();
        config.accel_cal.timeout_s = 1.0;
        let mut rig = rig_with(1, 1000.0, config, MemoryParamStore::new(), |_, _| {});
        rig.ins.start_accel_cal();
        rig.run_with_periodic(500);
        let timeout = CalResult::Failed(CalFailure::Timeout);
        assert_eq!(rig.ins.accel_cal_step(), timeout);
        assert_eq!(rig.ins.accel_cal_status(), timeout);
        assert!(!rig.ins.calibrating());
        assert_eq!(rig.ins.accel_cal_progress(), None);
        rig.run_with_periodic(300);
        assert_eq!(rig.ins.accel_cal_status(), timeout);
        assert_eq!(rig.ins.accel_cal_accept().unwrap(), timeout);
        assert_eq!(rig.ins.start_accel_cal(), CalResult::InProgress);
    }

    #[test]
    fn test_step_ends_session_that_timed_out_between_periodic_calls() {
        let mut config = quiet_config();
        config.accel_cal.timeout_s = 1.0;
        let mut rig = rig_with(1, 1000.0, config, MemoryParamStore::new(), |_, _| {});
        rig.ins.start_accel_cal();
        rig.run(500);
        assert_eq!(rig.ins.accel_cal_step(), CalResult::Failed(CalFailure::Timeout));
        assert_eq!(rig.ins.accel_cal_progress(), None);
        assert_eq!(rig.ins.accel_cal_status(), CalResult::Failed(CalFailure::Timeout));
    }

    #[test]
    fn test_step_while_collecting_keeps_samples() {
        let mut rig = rig(1, 1000.0);
        rig.run(10);
        rig.ins.start_accel_cal();
        assert_eq!(rig.ins.accel_cal_step(), CalResult::InProgress);
        // 50 cycles sit in the tap until the next periodic
        rig.run(50);
        assert_eq!(rig.ins.accel_cal_step(), CalResult::InProgress);
        rig.run_with_periodic(170);
        assert_eq!(rig.ins.accel_cal_progress(), Some((1, 6)));
    }

    #[test]
    fn test_cal_temperature_taken_during_collection() {
        let mut rig = rig(1, 1000.0);
        rig.controls[0].set_temperature(28.0);
        rig.run(10);
        rig.ins.start_accel_cal();
        run_six_positions(&mut rig);
        rig.controls[0].set_temperature(45.0);
        rig.run(20);
        assert_eq!(rig.ins.temperature(0), 45.0);
        assert_eq!(rig.ins.accel_cal_accept().unwrap(), CalResult::Success);
        assert_eq!(rig.ins.accel_calibration(0).unwrap().cal_temp, Some(28.0));
        assert_eq!(rig.ins.params().get("INS_ACC1_CALTEMP"), Some(28.0));
    }

    #[test]
    fn test_accept_can_require_reboot() {
        let mut config = quiet_config();
        config.accel_cal_requires_reboot = true;
        let mut rig = rig_with(1, 1000.0, config, MemoryParamStore::new(), |_, _| {});
        rig.run(10);
        rig.ins.start_accel_cal();
        run_six_positions(&mut rig);
        assert_eq!(rig.ins.accel_cal_accept().unwrap(), CalResult::RequiresReboot);
        assert!(rig.ins.reboot_required());
        assert!(rig.ins.pre_arm_checks().contains(&PreArmFailure::RebootRequired));
    }

    #[test]
    fn test_gyro_cal_estimates_bias() {
        let bias = Vec3::new(0.02, -0.01, 0.005);
        let mut rig = rig_with(2, 1000.0, quiet_config(), MemoryParamStore::new(), |_, cfg| {
            cfg.gyro_bias = bias;
        });
        rig.run(10);
        assert_eq!(rig.ins.calibrate_gyros(), CalResult::Success);
        for i in 0..2 {
            let cal = rig.ins.gyro_calibration(i).unwrap();
            assert_abs_diff_eq!(cal.offset, bias, epsilon = 0.001);
            assert_eq!(cal.cal_temp, Some(35.0));
            assert!(rig.ins.gyro_cal_ok(i));
        }
        rig.run(100);
        assert!(rig.ins.primary_gyro().norm() < 0.002);
        assert!((rig.ins.params().get("INS_GYR2OFFS_X").unwrap() - bias.x).abs() < 0.001);
    }

    #[test]
    fn test_gyro_cal_at_startup() {
        let bias = Vec3::new(-0.01, 0.0, 0.02);
        let config = InsConfig {
            gyro_cal_timing: GyroCalTiming::Startup,
            ..InsConfig::new()
        };
        let rig = rig_with(1, 1000.0, config, MemoryParamStore::new(), |_, cfg| {
            cfg.gyro_bias = bias;
        });
        assert_abs_diff_eq!(rig.ins.gyro_calibration(0).unwrap().offset, bias, epsilon = 0.001);
    }

    #[test]
    fn test_gyro_cal_fails_when_moving() {
        let mut config = quiet_config();
        config.gyro_cal.max_windows = 4;
        let mut rig = rig_with(1, 1000.0, config, MemoryParamStore::new(), |_, cfg| {
            cfg.gyro_bias = Vec3::new(0.02, 0.0, 0.0);
        });
        rig.controls[0].set_noise(0.3, 0.2);
        assert_eq!(rig.ins.calibrate_gyros(), CalResult::Failed(CalFailure::NotStill));
        assert!(!rig.ins.gyro_cal_ok(0));
        assert_eq!(rig.ins.gyro_calibration(0).unwrap().offset, Vec3::zeros());
        assert!(rig.ins.pre_arm_checks().contains(&PreArmFailure::GyroNotCalibrated(0)));
        assert_eq!(rig.ins.params().get("INS_GYROFFS_X"), None);
    }

    #[test]
    fn test_trim_from_tilted_vehicle() {
        let mut rig = rig(1, 1000.0);
        rig.controls[0].set_attitude(3f64.to_radians(), -2f64.to_radians());
        rig.run(10);
        assert_eq!(rig.ins.calibrate_trim(), CalResult::Success);
        let trim = rig.ins.take_new_trim().unwrap();
        assert!((trim.x - 3f64.to_radians()).abs() < 0.005, "roll {}", trim.x);
        assert!((trim.y + 2f64.to_radians()).abs() < 0.005, "pitch {}", trim.y);
        assert_eq!(rig.ins.take_new_trim(), None);
        assert_eq!(rig.ins.trim(), trim);
        assert_eq!(rig.ins.params().get("AHRS_TRIM_X"), Some(trim.x));

        rig.controls[0].set_attitude(20f64.to_radians(), 0.0);
        assert!(matches!(
            rig.ins.calibrate_trim(),
            CalResult::Failed(CalFailure::TrimOutOfRange(_))
        ));
        assert_eq!(rig.ins.trim(), trim);
    }
}
