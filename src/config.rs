//! Inertial sensor configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes. Filter and notch settings can also come from a [`ParamStore`].

use crate::batch::BatchConfig;
use crate::calibration::accel::FitModel;
use crate::error::{InsError, InsResult};
use crate::filters::{FftCaptureConfig, HarmonicNotchConfig, NotchSource};
use crate::params::{self, ParamStore};
use crate::rotation::Rotation;
use crate::types::MAX_INSTANCES;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Second harmonic notch slot
pub const MAX_NOTCHES: usize = 2;

/// What the published unfiltered reading holds when several raw samples
/// arrive in one loop cycle. Filters and delta integration see every sample
/// either way.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OversamplingPolicy {
    #[default]
    Average,
    LatestWins,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GyroCalTiming {
    Never,
    #[default]
    Startup,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive cycles without a sample before an instance is unhealthy
    pub missed_cycle_limit: u32,
    /// Errors within the window that mark an instance unhealthy
    pub error_threshold: u32,
    pub error_window_cycles: usize,
    /// Errors during this period after init count towards the startup baseline
    pub startup_grace_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            missed_cycle_limit: 3,
            error_threshold: 10,
            error_window_cycles: 400,
            startup_grace_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub accel_threshold_mss: f64,
    pub gyro_threshold_dps: f64,
    /// How long instances must have agreed before arming
    pub window_ms: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            accel_threshold_mss: 0.75,
            gyro_threshold_dps: 5.0,
            window_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GyroCalConfig {
    /// Loop cycles per averaging window
    pub window_cycles: u32,
    pub max_windows: u32,
    /// Per-axis standard deviation above which the vehicle counts as moving
    pub still_threshold_dps: f64,
    /// Window means closer than this count as converged
    pub converge_dps: f64,
}

impl Default for GyroCalConfig {
    fn default() -> Self {
        Self {
            window_cycles: 50,
            max_windows: 30,
            still_threshold_dps: 1.0,
            converge_dps: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelCalConfig {
    pub model: FitModel,
    /// Orientations to collect; raised to the model's parameter count if lower
    pub positions: usize,
    pub collect_time_s: f64,
    /// Operator inactivity timeout
    pub timeout_s: f64,
    pub fitness_tolerance_mss: f64,
    pub max_offset_change_mss: f64,
    pub min_separation_deg: f64,
    pub max_iterations: usize,
    pub scale_min: f64,
    pub scale_max: f64,
    pub offdiag_limit: f64,
}

impl Default for AccelCalConfig {
    fn default() -> Self {
        Self {
            model: FitModel::Sphere,
            positions: 6,
            collect_time_s: 0.5,
            timeout_s: 30.0,
            fitness_tolerance_mss: 0.5,
            max_offset_change_mss: 4.0,
            min_separation_deg: 20.0,
            max_iterations: 50,
            scale_min: 0.8,
            scale_max: 1.2,
            offdiag_limit: 0.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsConfig {
    pub loop_rate_hz: f64,
    /// Extra time past one loop period before a wait gives up
    pub max_jitter_us: u64,
    /// 0 selects the backend default
    pub accel_filter_hz: f64,
    pub gyro_filter_hz: f64,
    pub oversampling: OversamplingPolicy,
    /// Per-instance queue depth between backend and loop
    pub queue_depth: usize,
    pub health: HealthConfig,
    pub consistency: ConsistencyConfig,
    /// Vibration level (m/s²) below which the vehicle counts as still
    pub still_threshold: f64,
    pub gyro_cal_timing: GyroCalTiming,
    pub gyro_cal: GyroCalConfig,
    pub accel_cal: AccelCalConfig,
    pub trim_cycles: u32,
    pub trim_still_mss: f64,
    pub notches: Vec<HarmonicNotchConfig>,
    pub fft: FftCaptureConfig,
    pub batch: BatchConfig,
    pub use_accel: [bool; MAX_INSTANCES],
    pub use_gyro: [bool; MAX_INSTANCES],
    pub board_orientation: Rotation,
    pub accel_cal_requires_reboot: bool,
}

impl InsConfig {
    pub fn new() -> Self {
        Self {
            loop_rate_hz: 400.0,
            max_jitter_us: 500,
            accel_filter_hz: 20.0,
            gyro_filter_hz: 20.0,
            oversampling: OversamplingPolicy::Average,
            queue_depth: 64,
            health: HealthConfig::default(),
            consistency: ConsistencyConfig::default(),
            still_threshold: 2.5,
            gyro_cal_timing: GyroCalTiming::Startup,
            gyro_cal: GyroCalConfig::default(),
            accel_cal: AccelCalConfig::default(),
            trim_cycles: 200,
            trim_still_mss: 0.5,
            notches: vec![HarmonicNotchConfig::new()],
            fft: FftCaptureConfig::default(),
            batch: BatchConfig::default(),
            use_accel: [true; MAX_INSTANCES],
            use_gyro: [true; MAX_INSTANCES],
            board_orientation: Rotation::None,
            accel_cal_requires_reboot: false,
        }
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> InsResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: InsConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> InsResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> InsResult<()> {
        if !(self.loop_rate_hz.is_finite() && self.loop_rate_hz > 0.0) {
            return Err(InsError::InvalidLoopRate(self.loop_rate_hz));
        }
        if self.notches.len() > MAX_NOTCHES {
            return Err(InsError::Param(format!(
                "{} notch configurations, at most {MAX_NOTCHES} supported",
                self.notches.len()
            )));
        }
        if self.queue_depth == 0 {
            return Err(InsError::Param("queue_depth must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn loop_period_us(&self) -> u64 {
        (1.0e6 / self.loop_rate_hz).round() as u64
    }

    /// Overlay filter and notch settings stored in `store`
    pub fn apply_params(&mut self, store: &dyn ParamStore) {
        self.gyro_filter_hz = store.get_or(params::GYRO_FILTER, self.gyro_filter_hz);
        self.accel_filter_hz = store.get_or(params::ACCEL_FILTER, self.accel_filter_hz);
        for (i, notch) in self.notches.iter_mut().enumerate() {
            let prefix = notch_prefix(i);
            notch.enabled = store.get_or(&format!("{prefix}_ENABLE"), notch.enabled as u8 as f64) != 0.0;
            notch.center_hz = store.get_or(&format!("{prefix}_FREQ"), notch.center_hz);
            notch.bandwidth_hz = store.get_or(&format!("{prefix}_BW"), notch.bandwidth_hz);
            notch.attenuation_db = store.get_or(&format!("{prefix}_ATT"), notch.attenuation_db);
            notch.harmonics = store
                .get_or(&format!("{prefix}_HMNCS"), notch.harmonics as f64)
                .clamp(0.0, 255.0) as u8;
            notch.min_ratio = store.get_or(&format!("{prefix}_FM_RAT"), notch.min_ratio);
            if let Some(mode) = store.get(&format!("{prefix}_MODE")) {
                let ratio = store.get_or(&format!("{prefix}_REF"), 1.0);
                notch.source = notch_source_from_mode(mode as i64, ratio);
            }
        }
    }

    /// Write filter and notch settings into `store` (caller saves)
    pub fn write_params(&self, store: &mut dyn ParamStore) {
        store.set(params::GYRO_FILTER, self.gyro_filter_hz);
        store.set(params::ACCEL_FILTER, self.accel_filter_hz);
        for (i, notch) in self.notches.iter().enumerate() {
            let prefix = notch_prefix(i);
            store.set(&format!("{prefix}_ENABLE"), notch.enabled as u8 as f64);
            store.set(&format!("{prefix}_FREQ"), notch.center_hz);
            store.set(&format!("{prefix}_BW"), notch.bandwidth_hz);
            store.set(&format!("{prefix}_ATT"), notch.attenuation_db);
            store.set(&format!("{prefix}_HMNCS"), notch.harmonics as f64);
            store.set(&format!("{prefix}_FM_RAT"), notch.min_ratio);
            let (mode, ratio) = match notch.source {
                NotchSource::Fixed => (0.0, 1.0),
                NotchSource::Reference { ratio } => (1.0, ratio),
                NotchSource::DynamicSet => (3.0, 1.0),
            };
            store.set(&format!("{prefix}_MODE"), mode);
            store.set(&format!("{prefix}_REF"), ratio);
        }
    }
}

impl Default for InsConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn notch_prefix(index: usize) -> &'static str {
    if index == 0 {
        "INS_HNTCH"
    } else {
        "INS_HNTC2"
    }
}

fn notch_source_from_mode(mode: i64, ratio: f64) -> NotchSource {
    match mode {
        1 | 2 => NotchSource::Reference { ratio },
        3 | 4 => NotchSource::DynamicSet,
        _ => NotchSource::Fixed,
    }
}
