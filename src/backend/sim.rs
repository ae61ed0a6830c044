//! Simulated combined accel+gyro chip.
//!
//! [`SimBackend`] produces samples synchronously from `accumulate()` using
//! the loop's clock, which keeps tests deterministic. [`ThreadedSimBackend`]
//! runs the same generator on its own thread, like a driver with a bus
//! thread would.

use super::{Backend, SampleSink};
use crate::clock::Clock;
use crate::error::{InsError, InsResult};
use crate::registry::{Registrar, SensorRegistration, DEFAULT_ACCEL_CLIP_MSS};
use crate::rotation::Rotation;
use crate::types::{Delta, RawSample, SensorKind, Vec3, GRAVITY_MSS};
use crossbeam::atomic::AtomicCell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Specific force felt at rest with the given roll and pitch (radians)
pub fn specific_force_at(roll: f64, pitch: f64) -> Vec3 {
    Vec3::new(pitch.sin(), -roll.sin() * pitch.cos(), -roll.cos() * pitch.cos()) * GRAVITY_MSS
}

#[derive(Clone, Debug)]
pub struct SimImuConfig {
    pub raw_rate_hz: f64,
    pub accel_id: u32,
    pub gyro_id: u32,
    pub accel_noise_mss: f64,
    pub gyro_noise_rads: f64,
    /// Sensor error: raw = truth / scale + offset
    pub accel_offset: Vec3,
    pub accel_scale: Vec3,
    pub gyro_bias: Vec3,
    /// Sinusoidal vibration added to every accel axis
    pub vibration_hz: f64,
    pub vibration_mss: f64,
    /// Full-scale range; saturated readings sit here
    pub range_mss: f64,
    pub temperature: f64,
    pub orientation: Rotation,
    /// Attach delta-angle/velocity integrals to each sample
    pub emit_deltas: bool,
    pub seed: u64,
}

impl SimImuConfig {
    pub fn new(raw_rate_hz: f64, seed: u64) -> Self {
        Self {
            raw_rate_hz,
            accel_id: 0x10_0000 + seed as u32,
            gyro_id: 0x20_0000 + seed as u32,
            accel_noise_mss: 0.3,
            gyro_noise_rads: 0.1f64.to_radians(),
            accel_offset: Vec3::zeros(),
            accel_scale: Vec3::new(1.0, 1.0, 1.0),
            gyro_bias: Vec3::zeros(),
            vibration_hz: 0.0,
            vibration_mss: 0.0,
            range_mss: 16.0 * GRAVITY_MSS,
            temperature: 35.0,
            orientation: Rotation::None,
            emit_deltas: false,
            seed,
        }
    }
}

impl Default for SimImuConfig {
    fn default() -> Self {
        Self::new(1200.0, 1)
    }
}

/// Live vehicle state and fault switches
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimState {
    /// Body-frame specific force, m/s²
    pub specific_force: Vec3,
    /// Body-frame rates, rad/s
    pub rates: Vec3,
    pub accel_noise_mss: f64,
    pub gyro_noise_rads: f64,
    /// Die temperature, °C
    pub temperature: f64,
    pub killed: bool,
    pub saturated: bool,
}

/// Cloneable handle for steering a simulated IMU from a test or the CLI
#[derive(Clone)]
pub struct SimControl {
    state: Arc<AtomicCell<SimState>>,
}

impl SimControl {
    fn new(cfg: &SimImuConfig) -> Self {
        Self {
            state: Arc::new(AtomicCell::new(SimState {
                specific_force: specific_force_at(0.0, 0.0),
                rates: Vec3::zeros(),
                accel_noise_mss: cfg.accel_noise_mss,
                gyro_noise_rads: cfg.gyro_noise_rads,
                temperature: cfg.temperature,
                killed: false,
                saturated: false,
            })),
        }
    }

    pub fn state(&self) -> SimState {
        self.state.load()
    }

    fn modify(&self, f: impl FnOnce(&mut SimState)) {
        let mut s = self.state.load();
        f(&mut s);
        self.state.store(s);
    }

    pub fn set_specific_force(&self, force: Vec3) {
        self.modify(|s| s.specific_force = force);
    }

    pub fn set_attitude(&self, roll: f64, pitch: f64) {
        self.set_specific_force(specific_force_at(roll, pitch));
    }

    pub fn set_rates(&self, rates: Vec3) {
        self.modify(|s| s.rates = rates);
    }

    pub fn set_noise(&self, accel_mss: f64, gyro_rads: f64) {
        self.modify(|s| {
            s.accel_noise_mss = accel_mss;
            s.gyro_noise_rads = gyro_rads;
        });
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.modify(|s| s.temperature = celsius);
    }

    /// Stop producing samples, as a dead sensor would
    pub fn kill(&self, killed: bool) {
        self.modify(|s| s.killed = killed);
    }

    /// Pin accel readings at full scale
    pub fn saturate(&self, saturated: bool) {
        self.modify(|s| s.saturated = saturated);
    }
}

/// Sample generator shared by both backends
pub struct SimImu {
    cfg: SimImuConfig,
    rng: StdRng,
    control: SimControl,
}

impl SimImu {
    pub fn new(cfg: SimImuConfig) -> Self {
        let control = SimControl::new(&cfg);
        Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
            control,
        }
    }

    pub fn control(&self) -> SimControl {
        self.control.clone()
    }

    pub fn config(&self) -> &SimImuConfig {
        &self.cfg
    }

    pub fn period_us(&self) -> u64 {
        (1.0e6 / self.cfg.raw_rate_hz).round().max(1.0) as u64
    }

    fn gaussian_noise(&mut self, stddev: f64) -> f64 {
        if stddev == 0.0 {
            return 0.0;
        }
        let u1: f64 = self.rng.gen::<f64>().max(f64::EPSILON);
        let u2: f64 = self.rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        z * stddev
    }

    fn noise_vec(&mut self, stddev: f64) -> Vec3 {
        Vec3::new(
            self.gaussian_noise(stddev),
            self.gaussian_noise(stddev),
            self.gaussian_noise(stddev),
        )
    }

    /// Raw (accel, gyro) in the sensor frame at time `t_us`
    pub fn sample(&mut self, t_us: u64) -> (Vec3, Vec3) {
        let state = self.control.state();
        let t = t_us as f64 * 1.0e-6;

        let mut accel = state.specific_force;
        if self.cfg.vibration_mss > 0.0 {
            let v = self.cfg.vibration_mss * (2.0 * PI * self.cfg.vibration_hz * t).sin();
            accel += Vec3::new(v, v, v);
        }
        accel += self.noise_vec(state.accel_noise_mss);
        let mut accel = self.cfg.orientation.rotate_inverse(&accel);
        accel = accel.component_div(&self.cfg.accel_scale) + self.cfg.accel_offset;
        if state.saturated {
            accel.x = self.cfg.range_mss;
        }
        accel = accel.map(|c| c.clamp(-self.cfg.range_mss, self.cfg.range_mss));

        let gyro = state.rates + self.noise_vec(state.gyro_noise_rads);
        let gyro = self.cfg.orientation.rotate_inverse(&gyro) + self.cfg.gyro_bias;
        (accel, gyro)
    }

    fn registrations(&self) -> (SensorRegistration, SensorRegistration) {
        let accel = SensorRegistration::accel(self.cfg.raw_rate_hz, self.cfg.accel_id)
            .with_orientation(self.cfg.orientation)
            .with_clip_limit(DEFAULT_ACCEL_CLIP_MSS.min(self.cfg.range_mss - 0.5 * GRAVITY_MSS));
        let gyro = SensorRegistration::gyro(self.cfg.raw_rate_hz, self.cfg.gyro_id)
            .with_orientation(self.cfg.orientation);
        (accel, gyro)
    }

    fn raw_samples(&mut self, t_us: u64) -> Option<(RawSample, RawSample)> {
        let state = self.control.state();
        if state.killed {
            return None;
        }
        let (accel, gyro) = self.sample(t_us);
        let temperature = state.temperature;
        let mut a = RawSample::new(t_us, accel, temperature);
        let mut g = RawSample::new(t_us, gyro, temperature);
        if self.cfg.emit_deltas {
            let dt = 1.0 / self.cfg.raw_rate_hz;
            a = a.with_delta(Delta { value: accel * dt, dt });
            g = g.with_delta(Delta { value: gyro * dt, dt });
        }
        Some((a, g))
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Instances {
    accel: Option<usize>,
    gyro: Option<usize>,
}

fn probe_imu(imu: &SimImu, name: &str, registrar: &mut Registrar<'_>) -> InsResult<Instances> {
    let (accel_reg, gyro_reg) = imu.registrations();
    let mut instances = Instances::default();
    let ok = registrar.register_with(SensorKind::Accel, &mut instances.accel, &accel_reg)
        && registrar.register_with(SensorKind::Gyro, &mut instances.gyro, &gyro_reg);
    if !ok {
        return Err(InsError::Probe {
            name: name.to_string(),
            reason: "no free instance slot".to_string(),
        });
    }
    Ok(instances)
}

fn push_pair(sink: &SampleSink, instances: Instances, pair: (RawSample, RawSample)) {
    if let Some(i) = instances.accel {
        sink.push_accel(i, pair.0);
    }
    if let Some(i) = instances.gyro {
        sink.push_gyro(i, pair.1);
    }
}

/// Synchronous simulated IMU driven from `accumulate()`
pub struct SimBackend {
    name: String,
    imu: SimImu,
    instances: Instances,
    sink: Option<SampleSink>,
    next_sample_us: Option<u64>,
}

impl SimBackend {
    pub fn new(name: &str, cfg: SimImuConfig) -> Self {
        Self {
            name: name.to_string(),
            imu: SimImu::new(cfg),
            instances: Instances::default(),
            sink: None,
            next_sample_us: None,
        }
    }

    pub fn control(&self) -> SimControl {
        self.imu.control()
    }
}

impl Backend for SimBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self, registrar: &mut Registrar<'_>) -> InsResult<()> {
        self.instances = probe_imu(&self.imu, &self.name, registrar)?;
        Ok(())
    }

    fn start(&mut self, sink: SampleSink) {
        self.sink = Some(sink);
    }

    fn accumulate(&mut self, now_us: u64) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        let period = self.imu.period_us();
        let mut next = match self.next_sample_us {
            Some(next) => next,
            None => {
                self.next_sample_us = Some(now_us + period);
                return;
            }
        };
        while next <= now_us {
            if let Some(pair) = self.imu.raw_samples(next) {
                push_pair(sink, self.instances, pair);
            }
            next += period;
        }
        self.next_sample_us = Some(next);
    }
}

/// Simulated IMU sampling on its own thread
pub struct ThreadedSimBackend {
    name: String,
    imu: Option<SimImu>,
    control: SimControl,
    clock: Arc<dyn Clock>,
    instances: Instances,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedSimBackend {
    pub fn new(name: &str, cfg: SimImuConfig, clock: Arc<dyn Clock>) -> Self {
        let imu = SimImu::new(cfg);
        Self {
            name: name.to_string(),
            control: imu.control(),
            imu: Some(imu),
            clock,
            instances: Instances::default(),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn control(&self) -> SimControl {
        self.control.clone()
    }
}

impl Backend for ThreadedSimBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self, registrar: &mut Registrar<'_>) -> InsResult<()> {
        let Some(imu) = self.imu.as_ref() else {
            return Err(InsError::Probe {
                name: self.name.clone(),
                reason: "already started".to_string(),
            });
        };
        self.instances = probe_imu(imu, &self.name, registrar)?;
        Ok(())
    }

    fn start(&mut self, sink: SampleSink) {
        let Some(mut imu) = self.imu.take() else {
            return;
        };
        let clock = Arc::clone(&self.clock);
        let stop = Arc::clone(&self.stop);
        let instances = self.instances;
        let spawned = std::thread::Builder::new()
            .name(format!("{}-sampler", self.name))
            .spawn(move || {
                let period = imu.period_us();
                let mut next = clock.now_us() + period;
                while !stop.load(Ordering::Relaxed) {
                    let now = clock.now_us();
                    if now < next {
                        clock.sleep_us(next - now);
                        continue;
                    }
                    if let Some(pair) = imu.raw_samples(next) {
                        push_pair(&sink, instances, pair);
                    }
                    next += period;
                }
            });
        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => log::error!("{}: failed to start sampling thread: {}", self.name, e),
        }
    }
}

impl Drop for ThreadedSimBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use approx::assert_abs_diff_eq;

    fn quiet(rate: f64) -> SimImuConfig {
        SimImuConfig {
            accel_noise_mss: 0.0,
            gyro_noise_rads: 0.0,
            ..SimImuConfig::new(rate, 7)
        }
    }

    #[test]
    fn test_noise_free_sample_matches_state() {
        let mut cfg = quiet(1000.0);
        cfg.accel_offset = Vec3::new(0.5, 0.0, 0.0);
        cfg.accel_scale = Vec3::new(1.0, 1.0, 0.5);
        cfg.gyro_bias = Vec3::new(0.01, 0.0, 0.0);
        let mut imu = SimImu::new(cfg);
        let (accel, gyro) = imu.sample(0);
        assert_abs_diff_eq!(accel, Vec3::new(0.5, 0.0, -2.0 * GRAVITY_MSS), epsilon = 1e-12);
        assert_abs_diff_eq!(gyro, Vec3::new(0.01, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_noise_has_expected_spread() {
        let mut imu = SimImu::new(SimImuConfig::new(1000.0, 3));
        let n = 20_000;
        let xs: Vec<f64> = (0..n).map(|i| imu.sample(i).0.x).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.02, "mean {mean}");
        assert!((var.sqrt() - 0.3).abs() < 0.02, "sd {}", var.sqrt());
    }

    #[test]
    fn test_saturation_pins_full_scale() {
        let mut imu = SimImu::new(quiet(1000.0));
        imu.control().saturate(true);
        let (accel, _) = imu.sample(0);
        assert_eq!(accel.x, 16.0 * GRAVITY_MSS);
    }

    #[test]
    fn test_sync_backend_produces_at_raw_rate() {
        let mut registry = Registry::new(400.0);
        let mut backend = SimBackend::new("sim0", quiet(1000.0));
        backend.probe(&mut Registrar::new(&mut registry, 0)).unwrap();
        let sink = SampleSink::new(64);
        backend.start(sink.clone());

        backend.accumulate(0);
        backend.accumulate(10_000);
        assert_eq!(sink.stats(SensorKind::Accel, 0).pushed, 10);
        assert_eq!(sink.stats(SensorKind::Gyro, 0).pushed, 10);

        backend.control().kill(true);
        backend.accumulate(20_000);
        assert_eq!(sink.stats(SensorKind::Accel, 0).pushed, 10);
    }

    #[test]
    fn test_deltas_attached_when_enabled() {
        let mut cfg = quiet(500.0);
        cfg.emit_deltas = true;
        let mut imu = SimImu::new(cfg);
        let (a, g) = imu.raw_samples(0).unwrap();
        let da = a.delta.unwrap();
        assert_abs_diff_eq!(da.dt, 0.002, epsilon = 1e-12);
        assert_abs_diff_eq!(da.value, a.vector * 0.002, epsilon = 1e-12);
        assert!(g.delta.is_some());
    }
}
