//! Building blocks of the sample loop: loop pacing, per-instance channels
//! that turn raw samples into corrected and filtered values, delta
//! integration, and the published snapshot.

use crate::calibration::{AccelCalibration, GyroCalibration, TempCalibration};
use crate::clock::Clock;
use crate::config::OversamplingPolicy;
use crate::filters::{
    CapturePoint, FftCaptureConfig, FftCaptureWindow, HarmonicNotchBank, HarmonicNotchConfig, LowPassFilter2p,
};
use crate::instance_set::InstanceSet;
use crate::registry::SensorSlot;
use crate::rotation::Rotation;
use crate::types::{RawSample, Vec3, MAX_INSTANCES};
use crossbeam::atomic::AtomicCell;
use std::sync::Arc;

/// Loop periods a single `delta_time` may span
pub const MAX_DELTA_TIME_PERIODS: f64 = 10.0;

/// Keeps `wait_for_sample` on a fixed schedule
#[derive(Clone, Debug)]
pub struct LoopPacer {
    period_us: u64,
    next_sample_us: u64,
    last_sample_us: u64,
    started: bool,
}

impl LoopPacer {
    pub fn new(loop_rate_hz: f64) -> Self {
        Self {
            period_us: (1.0e6 / loop_rate_hz).round().max(1.0) as u64,
            next_sample_us: 0,
            last_sample_us: 0,
            started: false,
        }
    }

    pub fn period_us(&self) -> u64 {
        self.period_us
    }

    /// Sleep until the next slot when running ahead. A small overshoot keeps
    /// the schedule; a large one restarts it from now.
    pub fn pace(&mut self, clock: &dyn Clock) {
        let now = clock.now_us();
        if !self.started {
            self.started = true;
            self.last_sample_us = now.saturating_sub(self.period_us);
            self.next_sample_us = now + self.period_us;
            return;
        }
        if self.next_sample_us >= now && self.next_sample_us - now <= self.period_us {
            let ahead = self.next_sample_us - now;
            if ahead > 0 {
                clock.sleep_us(ahead);
            }
            self.next_sample_us += self.period_us;
        } else if now > self.next_sample_us && now - self.next_sample_us < self.period_us / 8 {
            self.next_sample_us += self.period_us;
        } else {
            self.next_sample_us = now + self.period_us;
        }
    }

    /// Mark a completed wait; returns seconds since the previous one
    pub fn sample_taken(&mut self, now_us: u64) -> f64 {
        let dt = now_us.saturating_sub(self.last_sample_us) as f64 * 1.0e-6;
        self.last_sample_us = now_us;
        dt.min(MAX_DELTA_TIME_PERIODS * self.period_us as f64 * 1.0e-6)
    }
}

/// Trapezoidal delta-angle integration with coning correction
#[derive(Clone, Copy, Debug, Default)]
pub struct DeltaAngleIntegrator {
    acc: Vec3,
    dt: f64,
    last_rate: Option<Vec3>,
    last_delta: Vec3,
}

impl DeltaAngleIntegrator {
    pub fn add_rate(&mut self, rate: &Vec3, dt: f64) {
        let last = self.last_rate.unwrap_or(*rate);
        let delta = (rate + last) * (0.5 * dt);
        self.add_delta(&delta, dt);
        self.last_rate = Some(*rate);
    }

    /// Backend-integrated delta angle
    pub fn add_delta(&mut self, delta: &Vec3, dt: f64) {
        let coning = (self.acc + self.last_delta / 6.0).cross(delta) * 0.5;
        self.acc += delta + coning;
        self.dt += dt;
        self.last_delta = *delta;
    }

    pub fn take(&mut self) -> (Vec3, f64) {
        let out = (self.acc, self.dt);
        self.acc = Vec3::zeros();
        self.dt = 0.0;
        self.last_delta = Vec3::zeros();
        out
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeltaVelocityIntegrator {
    acc: Vec3,
    dt: f64,
}

impl DeltaVelocityIntegrator {
    pub fn add(&mut self, accel: &Vec3, dt: f64) {
        self.add_delta(&(accel * dt), dt);
    }

    pub fn add_delta(&mut self, delta: &Vec3, dt: f64) {
        self.acc += delta;
        self.dt += dt;
    }

    pub fn take(&mut self) -> (Vec3, f64) {
        let out = (self.acc, self.dt);
        *self = Self::default();
        out
    }
}

/// Reduces the raw samples of one cycle to the published unfiltered value
#[derive(Clone, Copy, Debug, Default)]
pub struct Decimator {
    sum: Vec3,
    latest: Vec3,
    count: u32,
}

impl Decimator {
    pub fn add(&mut self, v: &Vec3) {
        self.sum += v;
        self.latest = *v;
        self.count += 1;
    }

    pub fn take(&mut self, policy: OversamplingPolicy) -> Option<Vec3> {
        if self.count == 0 {
            return None;
        }
        let out = match policy {
            OversamplingPolicy::Average => self.sum / self.count as f64,
            OversamplingPolicy::LatestWins => self.latest,
        };
        *self = Self::default();
        Some(out)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// One raw sample after the channel has processed it
#[derive(Clone, Copy, Debug)]
pub struct Processed {
    /// Sensor orientation and temperature correction only
    pub raw: Vec3,
    /// Calibrated, in the body frame
    pub corrected: Vec3,
    pub filtered: Vec3,
    pub dt: f64,
}

/// What a channel contributes to the snapshot for one cycle
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleOutput {
    pub unfiltered: Vec3,
    pub filtered: Vec3,
    pub delta: Vec3,
    pub delta_dt: f64,
    pub delta_valid: bool,
    pub samples: u32,
}

fn sample_dt(raw_rate_hz: f64) -> f64 {
    1.0 / raw_rate_hz
}

/// Accelerometer instance pipeline
#[derive(Clone, Debug)]
pub struct AccelChannel {
    pub orientation: Rotation,
    pub board: Rotation,
    pub cal: AccelCalibration,
    pub tcal: TempCalibration,
    raw_rate_hz: f64,
    lpf: LowPassFilter2p,
    delta: DeltaVelocityIntegrator,
    decimator: Decimator,
    filtered: Vec3,
    unfiltered: Vec3,
    pub temperature: f64,
    pub last_timestamp_us: u64,
    pub sample_count: u64,
}

impl AccelChannel {
    pub fn new(slot: &SensorSlot, board: Rotation, filter_hz: f64) -> Self {
        Self {
            orientation: slot.orientation,
            board,
            cal: AccelCalibration::default(),
            tcal: TempCalibration::default(),
            raw_rate_hz: slot.raw_rate_hz,
            lpf: LowPassFilter2p::new(slot.raw_rate_hz, filter_hz),
            delta: DeltaVelocityIntegrator::default(),
            decimator: Decimator::default(),
            filtered: Vec3::zeros(),
            unfiltered: Vec3::zeros(),
            temperature: 0.0,
            last_timestamp_us: 0,
            sample_count: 0,
        }
    }

    pub fn set_filter_hz(&mut self, filter_hz: f64) {
        self.lpf.set_cutoff(self.raw_rate_hz, filter_hz);
    }

    pub fn filter_hz(&self) -> f64 {
        self.lpf.cutoff_hz()
    }

    fn uncalibrated(&self, v: &Vec3, temperature: f64) -> Vec3 {
        let mut v = self.orientation.rotate(v);
        self.tcal.correct_accel(temperature, self.cal.cal_temp, &mut v);
        v
    }

    fn calibrate(&self, raw: &Vec3) -> Vec3 {
        self.board.rotate(&self.cal.apply(raw))
    }

    pub fn process(&mut self, sample: &RawSample) -> Processed {
        let dt = sample_dt(self.raw_rate_hz);
        let raw = self.uncalibrated(&sample.vector, sample.temperature);
        let corrected = self.calibrate(&raw);
        self.filtered = self.lpf.apply(&corrected);

        match sample.delta {
            Some(d) if d.dt > 0.0 => {
                let v = self.calibrate(&self.uncalibrated(&(d.value / d.dt), sample.temperature));
                self.delta.add_delta(&(v * d.dt), d.dt);
            }
            _ => self.delta.add(&corrected, dt),
        }
        self.decimator.add(&corrected);
        self.temperature = sample.temperature;
        self.last_timestamp_us = sample.timestamp_us;
        self.sample_count += 1;
        Processed {
            raw,
            corrected,
            filtered: self.filtered,
            dt,
        }
    }

    pub fn finish_cycle(&mut self, policy: OversamplingPolicy) -> CycleOutput {
        let samples = self.decimator.count();
        let delta_valid = match self.decimator.take(policy) {
            Some(v) => {
                self.unfiltered = v;
                true
            }
            None => false,
        };
        let (delta, delta_dt) = if delta_valid { self.delta.take() } else { (Vec3::zeros(), 0.0) };
        CycleOutput {
            unfiltered: self.unfiltered,
            filtered: self.filtered,
            delta,
            delta_dt,
            delta_valid,
            samples,
        }
    }
}

/// Gyroscope instance pipeline, with notches and FFT capture
#[derive(Clone, Debug)]
pub struct GyroChannel {
    pub orientation: Rotation,
    pub board: Rotation,
    pub cal: GyroCalibration,
    pub tcal: TempCalibration,
    raw_rate_hz: f64,
    lpf: LowPassFilter2p,
    notches: Vec<HarmonicNotchBank>,
    fft: Option<FftCaptureWindow>,
    capture: CapturePoint,
    delta: DeltaAngleIntegrator,
    decimator: Decimator,
    filtered: Vec3,
    unfiltered: Vec3,
    pub temperature: f64,
    pub last_timestamp_us: u64,
    pub sample_count: u64,
}

impl GyroChannel {
    pub fn new(
        slot: &SensorSlot,
        board: Rotation,
        filter_hz: f64,
        notches: &[HarmonicNotchConfig],
        fft: &FftCaptureConfig,
    ) -> Self {
        Self {
            orientation: slot.orientation,
            board,
            cal: GyroCalibration::default(),
            tcal: TempCalibration::default(),
            raw_rate_hz: slot.raw_rate_hz,
            lpf: LowPassFilter2p::new(slot.raw_rate_hz, filter_hz),
            notches: notches
                .iter()
                .map(|cfg| HarmonicNotchBank::new(cfg, slot.raw_rate_hz))
                .collect(),
            fft: fft.enabled.then(|| FftCaptureWindow::new(fft.window_size)),
            capture: fft.capture,
            delta: DeltaAngleIntegrator::default(),
            decimator: Decimator::default(),
            filtered: Vec3::zeros(),
            unfiltered: Vec3::zeros(),
            temperature: 0.0,
            last_timestamp_us: 0,
            sample_count: 0,
        }
    }

    pub fn set_filter_hz(&mut self, filter_hz: f64) {
        self.lpf.set_cutoff(self.raw_rate_hz, filter_hz);
    }

    pub fn filter_hz(&self) -> f64 {
        self.lpf.cutoff_hz()
    }

    pub fn notch(&self, index: usize) -> Option<&HarmonicNotchBank> {
        self.notches.get(index)
    }

    /// Retune notch `index` to new source frequencies
    pub fn update_notch(&mut self, index: usize, source_hz: &[f64]) {
        if let Some(bank) = self.notches.get_mut(index) {
            bank.update(source_hz);
        }
    }

    pub fn fft_window(&self) -> Option<&FftCaptureWindow> {
        self.fft.as_ref()
    }

    fn uncalibrated(&self, v: &Vec3, temperature: f64) -> Vec3 {
        let mut v = self.orientation.rotate(v);
        self.tcal.correct_gyro(temperature, self.cal.cal_temp, &mut v);
        v
    }

    fn calibrate(&self, raw: &Vec3) -> Vec3 {
        self.board.rotate(&self.cal.apply(raw))
    }

    pub fn process(&mut self, sample: &RawSample) -> Processed {
        let dt = sample_dt(self.raw_rate_hz);
        let raw = self.uncalibrated(&sample.vector, sample.temperature);
        let corrected = self.calibrate(&raw);

        if self.capture == CapturePoint::PreFilter {
            if let Some(fft) = self.fft.as_mut() {
                fft.push(&corrected);
            }
        }
        let mut notched = corrected;
        for bank in self.notches.iter_mut() {
            notched = bank.apply(&notched);
        }
        self.filtered = self.lpf.apply(&notched);
        if self.capture == CapturePoint::PostFilter {
            if let Some(fft) = self.fft.as_mut() {
                fft.push(&self.filtered);
            }
        }

        match sample.delta {
            Some(d) if d.dt > 0.0 => {
                let rate = self.calibrate(&self.uncalibrated(&(d.value / d.dt), sample.temperature));
                self.delta.add_delta(&(rate * d.dt), d.dt);
            }
            _ => self.delta.add_rate(&corrected, dt),
        }
        self.decimator.add(&corrected);
        self.temperature = sample.temperature;
        self.last_timestamp_us = sample.timestamp_us;
        self.sample_count += 1;
        Processed {
            raw,
            corrected,
            filtered: self.filtered,
            dt,
        }
    }

    pub fn finish_cycle(&mut self, policy: OversamplingPolicy) -> CycleOutput {
        let samples = self.decimator.count();
        let delta_valid = match self.decimator.take(policy) {
            Some(v) => {
                self.unfiltered = v;
                true
            }
            None => false,
        };
        let (delta, delta_dt) = if delta_valid { self.delta.take() } else { (Vec3::zeros(), 0.0) };
        CycleOutput {
            unfiltered: self.unfiltered,
            filtered: self.filtered,
            delta,
            delta_dt,
            delta_valid,
            samples,
        }
    }
}

/// Everything the control loop reads after `update()`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Snapshot {
    pub cycle: u64,
    pub timestamp_us: u64,
    /// Seconds between the last two completed waits
    pub delta_time: f64,
    pub accel: [Vec3; MAX_INSTANCES],
    pub gyro: [Vec3; MAX_INSTANCES],
    pub accel_unfiltered: [Vec3; MAX_INSTANCES],
    pub gyro_unfiltered: [Vec3; MAX_INSTANCES],
    pub delta_velocity: [Vec3; MAX_INSTANCES],
    pub delta_velocity_dt: [f64; MAX_INSTANCES],
    pub delta_velocity_valid: [bool; MAX_INSTANCES],
    pub delta_angle: [Vec3; MAX_INSTANCES],
    pub delta_angle_dt: [f64; MAX_INSTANCES],
    pub delta_angle_valid: [bool; MAX_INSTANCES],
    pub accel_temperature: [f64; MAX_INSTANCES],
    pub gyro_temperature: [f64; MAX_INSTANCES],
    pub accel_sample_count: [u64; MAX_INSTANCES],
    pub gyro_sample_count: [u64; MAX_INSTANCES],
    pub accel_present: InstanceSet,
    pub gyro_present: InstanceSet,
    pub accel_healthy: InstanceSet,
    pub gyro_healthy: InstanceSet,
    pub first_usable_accel: Option<usize>,
    pub first_usable_gyro: Option<usize>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            cycle: 0,
            timestamp_us: 0,
            delta_time: 0.0,
            accel: [Vec3::zeros(); MAX_INSTANCES],
            gyro: [Vec3::zeros(); MAX_INSTANCES],
            accel_unfiltered: [Vec3::zeros(); MAX_INSTANCES],
            gyro_unfiltered: [Vec3::zeros(); MAX_INSTANCES],
            delta_velocity: [Vec3::zeros(); MAX_INSTANCES],
            delta_velocity_dt: [0.0; MAX_INSTANCES],
            delta_velocity_valid: [false; MAX_INSTANCES],
            delta_angle: [Vec3::zeros(); MAX_INSTANCES],
            delta_angle_dt: [0.0; MAX_INSTANCES],
            delta_angle_valid: [false; MAX_INSTANCES],
            accel_temperature: [0.0; MAX_INSTANCES],
            gyro_temperature: [0.0; MAX_INSTANCES],
            accel_sample_count: [0; MAX_INSTANCES],
            gyro_sample_count: [0; MAX_INSTANCES],
            accel_present: InstanceSet::empty(),
            gyro_present: InstanceSet::empty(),
            accel_healthy: InstanceSet::empty(),
            gyro_healthy: InstanceSet::empty(),
            first_usable_accel: None,
            first_usable_gyro: None,
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the published snapshot, cheap to clone across threads
#[derive(Clone)]
pub struct SnapshotHandle {
    cell: Arc<AtomicCell<Snapshot>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(AtomicCell::new(Snapshot::new())),
        }
    }

    /// A whole snapshot, never a mix of two cycles
    pub fn load(&self) -> Snapshot {
        self.cell.load()
    }

    pub(crate) fn publish(&self, snapshot: Snapshot) {
        self.cell.store(snapshot);
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Things that happened inside `update()`, reported later by `periodic()`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncEvents {
    pub primary_accel_changes: u32,
    pub primary_gyro_changes: u32,
    pub health_transitions: u32,
    pub timeouts: u32,
    pub partial_cycles: u32,
}

impl SyncEvents {
    pub fn take(&mut self) -> SyncEvents {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        *self == SyncEvents::default()
    }
}
