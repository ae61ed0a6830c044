//! Operator-driven accelerometer calibration across every accel instance.

use super::accel::{AccelCalStatus, AccelCalibrator, FitOutcome};
use super::{AccelCalibration, RawTap, TapChannel};
use crate::config::AccelCalConfig;
use crate::error::{CalFailure, CalResult};
use crate::instance_set::InstanceSet;
use crate::types::{Vec3, MAX_INSTANCES};

/// One calibration run. Holds no reference to live calibration; results are
/// only applied when the caller accepts them.
#[derive(Debug)]
pub struct AccelCalSession {
    cfg: AccelCalConfig,
    calibrators: [Option<AccelCalibrator>; MAX_INSTANCES],
    /// Instance whose first (level) sample sets the trim
    level_instance: Option<usize>,
    started_ms: u64,
    last_activity_ms: u64,
    timeout_ms: u64,
    steps: u32,
    /// Samples seen while each instance was collecting
    collected_temp: [TapChannel; MAX_INSTANCES],
}

impl AccelCalSession {
    pub fn new(cfg: &AccelCalConfig, accels: InstanceSet, level_instance: Option<usize>, now_ms: u64) -> Self {
        let calibrators = std::array::from_fn(|i| {
            accels.contains(i).then(|| {
                let mut cal = AccelCalibrator::new(cfg);
                cal.start();
                cal
            })
        });
        Self {
            cfg: cfg.clone(),
            calibrators,
            level_instance: level_instance.filter(|i| accels.contains(*i)),
            started_ms: now_ms,
            last_activity_ms: now_ms,
            timeout_ms: (cfg.timeout_s * 1000.0).max(0.0) as u64,
            steps: 0,
            collected_temp: [TapChannel::default(); MAX_INSTANCES],
        }
    }

    fn active(&self) -> impl Iterator<Item = (usize, &AccelCalibrator)> {
        self.calibrators
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c)))
    }

    fn active_mut(&mut self) -> impl Iterator<Item = &mut AccelCalibrator> {
        self.calibrators.iter_mut().flatten()
    }

    pub fn instances(&self) -> InstanceSet {
        let mut set = InstanceSet::empty();
        for (i, _) in self.active() {
            set.insert(i);
        }
        set
    }

    pub fn started_ms(&self) -> u64 {
        self.started_ms
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn positions(&self) -> usize {
        self.active().map(|(_, c)| c.positions()).max().unwrap_or(0)
    }

    pub fn collected(&self) -> usize {
        self.active().map(|(_, c)| c.samples().len()).min().unwrap_or(0)
    }

    pub fn waiting_for_orientation(&self) -> bool {
        self.active()
            .all(|(_, c)| c.status() == AccelCalStatus::WaitingForOrientation)
    }

    /// The vehicle is in the next orientation: start collecting on every
    /// instance
    pub fn step(&mut self, now_ms: u64) -> CalResult {
        let status = self.status(now_ms);
        if matches!(status, CalResult::Failed(_)) {
            return status;
        }
        if self.waiting_for_orientation() {
            for cal in self.active_mut() {
                cal.begin_sample();
            }
            self.steps += 1;
            self.last_activity_ms = now_ms;
        }
        self.status(now_ms)
    }

    /// Feed drained raw accumulations to instances that are collecting
    pub fn feed(&mut self, tap: &RawTap) {
        for (i, slot) in self.calibrators.iter_mut().enumerate() {
            if let Some(cal) = slot {
                let ch = &tap.accel[i];
                if cal.status() == AccelCalStatus::CollectingSample {
                    self.collected_temp[i].merge(ch);
                }
                if ch.dt() > 0.0 {
                    cal.add_delta_velocity(&ch.integral(), ch.dt());
                }
            }
        }
    }

    /// Solve every instance that has all its samples
    pub fn run_fits(
        &mut self,
        prior: &[AccelCalibration; MAX_INSTANCES],
        max_abs_offset: &[f64; MAX_INSTANCES],
    ) -> usize {
        let mut solved = 0;
        for (i, slot) in self.calibrators.iter_mut().enumerate() {
            if let Some(cal) = slot {
                if cal.status() == AccelCalStatus::ReadyToFit {
                    cal.run_fit(&self.cfg, &prior[i], max_abs_offset[i]);
                    solved += 1;
                }
            }
        }
        solved
    }

    /// Mean temperature over the samples an instance collected
    pub fn collection_temperature(&self, instance: usize) -> Option<f64> {
        self.collected_temp.get(instance)?.mean_temperature()
    }

    pub fn timed_out(&self, now_ms: u64) -> bool {
        self.timeout_ms > 0 && now_ms.saturating_sub(self.last_activity_ms) > self.timeout_ms
    }

    pub fn status(&self, now_ms: u64) -> CalResult {
        if let Some(failure) = self.active().find_map(|(_, c)| c.failure()) {
            return CalResult::Failed(failure);
        }
        if self.active().next().is_none() {
            return CalResult::Failed(CalFailure::NoSensor);
        }
        if self.active().all(|(_, c)| c.status() == AccelCalStatus::Success) {
            return CalResult::Success;
        }
        if self.timed_out(now_ms) {
            return CalResult::Failed(CalFailure::Timeout);
        }
        CalResult::InProgress
    }

    /// Fitted results, only once every instance has succeeded
    pub fn results(&self) -> Option<[Option<FitOutcome>; MAX_INSTANCES]> {
        if !self.active().all(|(_, c)| c.status() == AccelCalStatus::Success) {
            return None;
        }
        Some(std::array::from_fn(|i| {
            self.calibrators[i].as_ref().and_then(|c| c.outcome().copied())
        }))
    }

    /// Level sample of the trim instance, corrected by its new fit
    pub fn level_sample(&self) -> Option<Vec3> {
        let i = self.level_instance?;
        self.calibrators[i].as_ref()?.corrected_sample(0)
    }
}
