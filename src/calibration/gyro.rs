use super::TapChannel;
use crate::config::GyroCalConfig;
use crate::error::CalFailure;
use crate::types::Vec3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GyroCalState {
    Running,
    Converged(Vec3),
    Failed(CalFailure),
}

/// Static bias estimate for one gyro from consecutive averaging windows.
///
/// A window counts only if every axis is quieter than the stillness
/// threshold; two still windows whose means agree give the bias.
#[derive(Clone, Debug)]
pub struct GyroCalibrator {
    still_threshold: f64,
    converge_threshold: f64,
    max_windows: u32,
    windows: u32,
    still_windows: u32,
    last_mean: Option<Vec3>,
    state: GyroCalState,
    temperature: Option<f64>,
}

impl GyroCalibrator {
    pub fn new(cfg: &GyroCalConfig) -> Self {
        Self {
            still_threshold: cfg.still_threshold_dps.to_radians(),
            converge_threshold: cfg.converge_dps.to_radians(),
            max_windows: cfg.max_windows.max(2),
            windows: 0,
            still_windows: 0,
            last_mean: None,
            state: GyroCalState::Running,
            temperature: None,
        }
    }

    pub fn state(&self) -> GyroCalState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == GyroCalState::Running
    }

    /// Mean temperature of the converging windows
    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn add_window(&mut self, window: &TapChannel) {
        if !self.is_running() {
            return;
        }
        self.windows += 1;

        if let (Some(mean), Some(sd)) = (window.mean(), window.std_dev()) {
            if sd.max() > self.still_threshold {
                self.last_mean = None;
            } else {
                self.still_windows += 1;
                if let Some(last) = self.last_mean {
                    if (mean - last).norm() < self.converge_threshold {
                        self.state = GyroCalState::Converged((mean + last) * 0.5);
                        self.temperature = window.mean_temperature();
                        return;
                    }
                }
                self.last_mean = Some(mean);
            }
        }

        if self.windows >= self.max_windows {
            let failure = if self.still_windows == 0 {
                CalFailure::NotStill
            } else {
                CalFailure::Divergent
            };
            self.state = GyroCalState::Failed(failure);
        }
    }
}
