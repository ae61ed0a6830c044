//! The inertial sensor manager.
//!
//! One [`InertialSensor`] is built at process start and handed to whoever
//! needs it. The control loop calls [`InertialSensor::wait_for_sample`] and
//! [`InertialSensor::update`] once per cycle; a slower task calls
//! [`InertialSensor::periodic`] for logging, calibration progress and batch
//! draining. Other threads read the published state through a
//! [`SnapshotHandle`].

mod calibrate;
mod persist;
mod prearm;

use crate::backend::{Backend, SampleSink};
use crate::batch::{BatchChunk, BatchSampler};
use crate::calibration::{AccelCalSession, AccelCalibration, GyroCalibration, RawTap};
use crate::clock::Clock;
use crate::config::{GyroCalTiming, InsConfig, MAX_NOTCHES};
use crate::error::{CalResult, InsError, InsResult};
use crate::filters::{NotchSource, MAX_NOTCH_SOURCES};
use crate::health::{self, ConsistencyLatch, InstanceHealth};
use crate::instance_set::InstanceSet;
use crate::params::ParamStore;
use crate::records::{ImuRecord, LogRecords, VibeRecord};
use crate::registry::{Registrar, Registry, SensorSlot};
use crate::status::{InsStatus, InstanceStatus};
use crate::sync::{AccelChannel, GyroChannel, LoopPacer, Snapshot, SnapshotHandle, SyncEvents};
use crate::types::{to_array, SensorKind, Vec3, MAX_INSTANCES};
use crate::vibration::{PeakHold, VibrationMonitor};
use crossbeam::channel::Receiver;
use std::sync::Arc;

#[cfg(feature = "fft")]
use crate::fft::PeakDetector;

/// Sleep between readiness polls while waiting for samples
const WAIT_POLL_US: u64 = 100;

fn enabled_set(flags: &[bool; MAX_INSTANCES]) -> InstanceSet {
    let mut set = InstanceSet::empty();
    for (i, &on) in flags.iter().enumerate() {
        set.set(i, on);
    }
    set
}

/// Configured cutoff, or the backend's default when it is 0
fn filter_hz(configured: f64, slot: &SensorSlot) -> f64 {
    if configured > 0.0 {
        configured
    } else {
        slot.default_filter_hz
    }
}

pub struct InertialSensor {
    config: InsConfig,
    clock: Arc<dyn Clock>,
    params: Box<dyn ParamStore>,
    registry: Registry,
    backends: Vec<Box<dyn Backend>>,
    detected: bool,
    sink: SampleSink,
    initialised: bool,
    init_ms: u64,

    pacer: LoopPacer,
    have_sample: bool,
    delta_time: f64,
    wait_accel: InstanceSet,
    wait_gyro: InstanceSet,
    killed: InstanceSet,

    accels: [Option<AccelChannel>; MAX_INSTANCES],
    gyros: [Option<GyroChannel>; MAX_INSTANCES],
    accel_health: [InstanceHealth; MAX_INSTANCES],
    gyro_health: [InstanceHealth; MAX_INSTANCES],
    vibration: [VibrationMonitor; MAX_INSTANCES],
    peak_hold: PeakHold,
    accels_consistent: bool,
    gyros_consistent: bool,
    accel_latch: ConsistencyLatch,
    gyro_latch: ConsistencyLatch,

    staged_notch: [[f64; MAX_NOTCH_SOURCES]; MAX_NOTCHES],
    staged_count: [usize; MAX_NOTCHES],
    notch_dirty: bool,

    tap: RawTap,
    accel_cal: Option<AccelCalSession>,
    accel_cal_reported: Option<CalResult>,
    accel_cal_ok: [bool; MAX_INSTANCES],
    gyro_cal_ok: [bool; MAX_INSTANCES],
    positions: [Vec3; MAX_INSTANCES],
    trim: Vec3,
    new_trim: Option<Vec3>,
    reboot_required: bool,

    snapshot: Snapshot,
    handle: SnapshotHandle,
    events: SyncEvents,
    batch: BatchSampler,
    log_pending: bool,
    logged_accel_healthy: InstanceSet,
    logged_gyro_healthy: InstanceSet,
    logged_overruns: [[u32; MAX_INSTANCES]; 2],

    #[cfg(feature = "fft")]
    peak_detector: Option<PeakDetector>,
}

impl InertialSensor {
    /// Filter and notch settings found in `params` override `config`
    pub fn new(mut config: InsConfig, clock: Arc<dyn Clock>, params: Box<dyn ParamStore>) -> InsResult<Self> {
        config.apply_params(params.as_ref());
        config.validate()?;
        let loop_rate = config.loop_rate_hz;
        let health_cfg = config.health.clone();
        Ok(Self {
            clock,
            params,
            registry: Registry::new(loop_rate),
            backends: Vec::new(),
            detected: false,
            sink: SampleSink::new(config.queue_depth),
            initialised: false,
            init_ms: 0,
            pacer: LoopPacer::new(loop_rate),
            have_sample: false,
            delta_time: 0.0,
            wait_accel: InstanceSet::empty(),
            wait_gyro: InstanceSet::empty(),
            killed: InstanceSet::empty(),
            accels: Default::default(),
            gyros: Default::default(),
            accel_health: std::array::from_fn(|_| InstanceHealth::new(&health_cfg)),
            gyro_health: std::array::from_fn(|_| InstanceHealth::new(&health_cfg)),
            vibration: Default::default(),
            peak_hold: PeakHold::default(),
            accels_consistent: true,
            gyros_consistent: true,
            accel_latch: ConsistencyLatch::default(),
            gyro_latch: ConsistencyLatch::default(),
            staged_notch: [[0.0; MAX_NOTCH_SOURCES]; MAX_NOTCHES],
            staged_count: [0; MAX_NOTCHES],
            notch_dirty: false,
            tap: RawTap::default(),
            accel_cal: None,
            accel_cal_reported: None,
            accel_cal_ok: [false; MAX_INSTANCES],
            gyro_cal_ok: [false; MAX_INSTANCES],
            positions: [Vec3::zeros(); MAX_INSTANCES],
            trim: Vec3::zeros(),
            new_trim: None,
            reboot_required: false,
            snapshot: Snapshot::new(),
            handle: SnapshotHandle::new(),
            events: SyncEvents::default(),
            batch: BatchSampler::new(&config.batch),
            log_pending: false,
            logged_accel_healthy: InstanceSet::empty(),
            logged_gyro_healthy: InstanceSet::empty(),
            logged_overruns: [[0; MAX_INSTANCES]; 2],
            #[cfg(feature = "fft")]
            peak_detector: None,
            config,
        })
    }

    /// Hand over a backend to be probed at `init`
    pub fn add_backend(&mut self, backend: Box<dyn Backend>) -> InsResult<()> {
        if self.detected {
            return Err(InsError::RegistrationClosed);
        }
        self.backends.push(backend);
        Ok(())
    }

    pub fn init(&mut self, loop_rate_hz: f64) -> InsResult<()> {
        if self.initialised {
            return Ok(());
        }
        if !(loop_rate_hz.is_finite() && loop_rate_hz > 0.0) {
            return Err(InsError::InvalidLoopRate(loop_rate_hz));
        }
        self.config.loop_rate_hz = loop_rate_hz;
        self.pacer = LoopPacer::new(loop_rate_hz);
        if !self.detected {
            self.registry = Registry::new(loop_rate_hz);
            self.load_saved_ids();
        }
        let instances = self.detect_backends();
        if instances == 0 {
            log::warn!("no inertial sensors detected");
        }
        for slot in self.registry.rate_mismatches() {
            log::warn!(
                "{} {} at {} Hz is not a whole multiple of the {} Hz loop",
                slot.kind,
                slot.backend,
                slot.raw_rate_hz,
                loop_rate_hz
            );
        }

        self.build_channels();
        self.load_calibration();
        for backend in self.backends.iter_mut() {
            backend.start(self.sink.clone());
        }
        let accel_rates: Vec<(usize, f64)> = self
            .registry
            .iter(SensorKind::Accel)
            .map(|(i, s)| (i, s.raw_rate_hz))
            .collect();
        let gyro_rates: Vec<(usize, f64)> = self
            .registry
            .iter(SensorKind::Gyro)
            .map(|(i, s)| (i, s.raw_rate_hz))
            .collect();
        self.batch.set_sensors(&accel_rates, &gyro_rates);

        #[cfg(feature = "fft")]
        {
            if self.config.fft.enabled {
                if let Some(&(_, rate)) = gyro_rates.first() {
                    self.peak_detector = Some(PeakDetector::new(self.config.fft.window_size, rate));
                }
            }
        }

        let accels = self.registry.present(SensorKind::Accel);
        let gyros = self.registry.present(SensorKind::Gyro);
        self.wait_accel = accels;
        self.wait_gyro = gyros;
        self.logged_accel_healthy = accels;
        self.logged_gyro_healthy = gyros;
        self.snapshot.accel_present = accels;
        self.snapshot.gyro_present = gyros;
        self.snapshot.accel_healthy = accels;
        self.snapshot.gyro_healthy = gyros;
        self.snapshot.first_usable_accel = accels.intersection(enabled_set(&self.config.use_accel)).first();
        self.snapshot.first_usable_gyro = gyros.intersection(enabled_set(&self.config.use_gyro)).first();
        self.handle.publish(self.snapshot);

        self.init_ms = self.clock.now_ms();
        self.initialised = true;
        log::info!(
            "inertial sensors ready: {} accel, {} gyro, loop {} Hz",
            accels.len(),
            gyros.len(),
            loop_rate_hz
        );

        if self.config.gyro_cal_timing == GyroCalTiming::Startup && !gyros.is_empty() {
            let result = self.calibrate_gyros();
            log::info!("startup gyro calibration: {:?}", result);
        }
        Ok(())
    }

    /// Probe every backend once; later calls do nothing. Returns the number
    /// of registered instances.
    pub fn detect_backends(&mut self) -> usize {
        if !self.detected {
            self.detected = true;
            for backend in self.backends.iter_mut() {
                let id = self.registry.add_backend(backend.name());
                let mut registrar = Registrar::new(&mut self.registry, id);
                match backend.probe(&mut registrar) {
                    Ok(()) => log::info!("backend {} detected", backend.name()),
                    Err(e) => log::warn!("backend {} probe failed: {}", backend.name(), e),
                }
            }
            self.registry.seal();
        }
        self.registry.count(SensorKind::Accel) + self.registry.count(SensorKind::Gyro)
    }

    fn build_channels(&mut self) {
        let board = self.config.board_orientation;
        for (i, slot) in self.registry.iter(SensorKind::Accel) {
            self.accels[i] = Some(AccelChannel::new(slot, board, filter_hz(self.config.accel_filter_hz, slot)));
        }
        for (i, slot) in self.registry.iter(SensorKind::Gyro) {
            self.gyros[i] = Some(GyroChannel::new(
                slot,
                board,
                filter_hz(self.config.gyro_filter_hz, slot),
                &self.config.notches,
                &self.config.fft,
            ));
        }
    }

    fn ready_sets(&self) -> (InstanceSet, InstanceSet) {
        let mut accel = InstanceSet::empty();
        let mut gyro = InstanceSet::empty();
        for i in 0..MAX_INSTANCES {
            accel.set(i, self.accels[i].is_some() && self.sink.has_pending(SensorKind::Accel, i));
            gyro.set(i, self.gyros[i].is_some() && self.sink.has_pending(SensorKind::Gyro, i));
        }
        (accel.difference(self.killed), gyro.difference(self.killed))
    }

    /// Block until the instances in the wait-mask have new samples, or until
    /// the cycle deadline passes.
    pub fn wait_for_sample(&mut self) {
        if !self.initialised || self.have_sample {
            return;
        }
        self.pacer.pace(self.clock.as_ref());

        let period = self.pacer.period_us();
        let start = self.clock.now_us();
        loop {
            let now = self.clock.now_us();
            for backend in self.backends.iter_mut() {
                backend.accumulate(now);
            }
            let (accel_ready, gyro_ready) = self.ready_sets();
            if accel_ready.is_superset(self.wait_accel) && gyro_ready.is_superset(self.wait_gyro) {
                break;
            }
            let elapsed = now.saturating_sub(start);
            if elapsed >= period / 3 && !accel_ready.is_empty() && !gyro_ready.is_empty() {
                self.events.partial_cycles += 1;
                break;
            }
            if elapsed >= period + self.config.max_jitter_us {
                self.events.timeouts += 1;
                break;
            }
            self.clock.sleep_us(WAIT_POLL_US);
        }
        self.delta_time = self.pacer.sample_taken(self.clock.now_us());
        self.have_sample = true;
    }

    /// Drain the queues, run every instance through its pipeline and publish
    /// a new snapshot. Waits first if no wait has completed since the last
    /// update.
    pub fn update(&mut self) {
        if !self.initialised {
            return;
        }
        if !self.have_sample {
            self.wait_for_sample();
        }
        let now_us = self.clock.now_us();
        let now_ms = now_us / 1000;
        let in_grace = now_ms.saturating_sub(self.init_ms) < self.config.health.startup_grace_ms;
        let policy = self.config.oversampling;

        if self.notch_dirty {
            for ch in self.gyros.iter_mut().flatten() {
                for n in 0..MAX_NOTCHES {
                    if self.staged_count[n] > 0 {
                        ch.update_notch(n, &self.staged_notch[n][..self.staged_count[n]]);
                    }
                }
            }
            self.staged_count = [0; MAX_NOTCHES];
            self.notch_dirty = false;
        }

        for i in 0..MAX_INSTANCES {
            let Some(ch) = self.gyros[i].as_mut() else {
                continue;
            };
            let mut delivered = false;
            while let Some(sample) = self.sink.pop(SensorKind::Gyro, i) {
                if self.killed.contains(i) {
                    continue;
                }
                let p = ch.process(&sample);
                self.tap.gyro[i].add(&p.raw, p.dt, sample.temperature);
                if self.batch.wants(SensorKind::Gyro, i) {
                    let v = if self.batch.post_filter() { p.filtered } else { p.corrected };
                    self.batch.push(SensorKind::Gyro, i, sample.timestamp_us, &v);
                }
                delivered = true;
            }
            let out = ch.finish_cycle(policy);
            let snap = &mut self.snapshot;
            snap.gyro[i] = out.filtered;
            snap.gyro_unfiltered[i] = out.unfiltered;
            snap.delta_angle[i] = out.delta;
            snap.delta_angle_dt[i] = out.delta_dt;
            snap.delta_angle_valid[i] = out.delta_valid;
            snap.gyro_temperature[i] = ch.temperature;
            snap.gyro_sample_count[i] = ch.sample_count;

            let errors = self.sink.stats(SensorKind::Gyro, i).errors;
            if self.gyro_health[i].record_cycle(delivered, errors, in_grace).is_some() {
                self.events.health_transitions += 1;
            }
            self.wait_gyro.set(i, delivered);
        }

        let primary_accel = self.snapshot.first_usable_accel;
        for i in 0..MAX_INSTANCES {
            let Some(ch) = self.accels[i].as_mut() else {
                continue;
            };
            let clip_limit = self
                .registry
                .slot(SensorKind::Accel, i)
                .map_or(f64::INFINITY, |s| s.clip_limit);
            let mut delivered = false;
            while let Some(sample) = self.sink.pop(SensorKind::Accel, i) {
                if self.killed.contains(i) {
                    continue;
                }
                let p = ch.process(&sample);
                self.tap.accel[i].add(&p.raw, p.dt, sample.temperature);
                self.vibration[i].apply(&p.raw, p.dt, clip_limit);
                if primary_accel == Some(i) {
                    self.peak_hold.update(p.corrected.x, now_ms);
                }
                if self.batch.wants(SensorKind::Accel, i) {
                    let v = if self.batch.post_filter() { p.filtered } else { p.corrected };
                    self.batch.push(SensorKind::Accel, i, sample.timestamp_us, &v);
                }
                delivered = true;
            }
            let out = ch.finish_cycle(policy);
            let snap = &mut self.snapshot;
            snap.accel[i] = out.filtered;
            snap.accel_unfiltered[i] = out.unfiltered;
            snap.delta_velocity[i] = out.delta;
            snap.delta_velocity_dt[i] = out.delta_dt;
            snap.delta_velocity_valid[i] = out.delta_valid;
            snap.accel_temperature[i] = ch.temperature;
            snap.accel_sample_count[i] = ch.sample_count;

            let errors = self.sink.stats(SensorKind::Accel, i).errors;
            if self.accel_health[i].record_cycle(delivered, errors, in_grace).is_some() {
                self.events.health_transitions += 1;
            }
            self.wait_accel.set(i, delivered);
        }

        self.update_selection(now_ms);

        self.snapshot.cycle += 1;
        self.snapshot.timestamp_us = now_us;
        self.snapshot.delta_time = self.delta_time;
        self.handle.publish(self.snapshot);
        self.log_pending = true;
        self.have_sample = false;
    }

    /// Health sets, consistency, voting and first-usable choice
    fn update_selection(&mut self, now_ms: u64) {
        let accel_present = self.registry.present(SensorKind::Accel);
        let gyro_present = self.registry.present(SensorKind::Gyro);
        let mut accel_healthy = InstanceSet::empty();
        let mut gyro_healthy = InstanceSet::empty();
        let mut accel_errors = InstanceSet::empty();
        let mut gyro_errors = InstanceSet::empty();
        for i in 0..MAX_INSTANCES {
            accel_healthy.set(i, accel_present.contains(i) && self.accel_health[i].is_healthy());
            gyro_healthy.set(i, gyro_present.contains(i) && self.gyro_health[i].is_healthy());
            accel_errors.set(i, self.accel_health[i].errors_since_startup() > 0);
            gyro_errors.set(i, self.gyro_health[i].errors_since_startup() > 0);
        }

        let accel_threshold = self.config.consistency.accel_threshold_mss;
        let gyro_threshold = self.config.consistency.gyro_threshold_dps.to_radians();
        self.accels_consistent = health::vectors_consistent(&self.snapshot.accel, accel_healthy, accel_threshold);
        self.gyros_consistent = health::vectors_consistent(&self.snapshot.gyro, gyro_healthy, gyro_threshold);
        self.accel_latch.update(self.accels_consistent, now_ms);
        self.gyro_latch.update(self.gyros_consistent, now_ms);

        let accel_primary = health::select_primary(
            accel_healthy,
            enabled_set(&self.config.use_accel),
            health::outliers(&self.snapshot.accel, accel_healthy, accel_threshold),
            accel_errors,
        );
        let gyro_primary = health::select_primary(
            gyro_healthy,
            enabled_set(&self.config.use_gyro),
            health::outliers(&self.snapshot.gyro, gyro_healthy, gyro_threshold),
            gyro_errors,
        );
        if accel_primary != self.snapshot.first_usable_accel {
            self.events.primary_accel_changes += 1;
        }
        if gyro_primary != self.snapshot.first_usable_gyro {
            self.events.primary_gyro_changes += 1;
        }

        let snap = &mut self.snapshot;
        snap.accel_present = accel_present;
        snap.gyro_present = gyro_present;
        snap.accel_healthy = accel_healthy;
        snap.gyro_healthy = gyro_healthy;
        snap.first_usable_accel = accel_primary;
        snap.first_usable_gyro = gyro_primary;
    }

    /// Lower-rate housekeeping: event reporting, calibration progress,
    /// batch draining and spectral tracking
    pub fn periodic(&mut self) {
        if !self.initialised {
            return;
        }
        let now_ms = self.clock.now_ms();
        self.report_events();
        let tap = self.tap.take();
        if self.accel_cal.is_some() {
            self.progress_accel_cal(&tap, now_ms);
        }
        self.batch.periodic(now_ms);
        #[cfg(feature = "fft")]
        self.track_spectral_peaks();
    }

    fn report_events(&mut self) {
        let events = self.events.take();
        if events.primary_accel_changes > 0 {
            log::info!("primary accel now {:?}", self.snapshot.first_usable_accel);
        }
        if events.primary_gyro_changes > 0 {
            log::info!("primary gyro now {:?}", self.snapshot.first_usable_gyro);
        }
        if events.timeouts > 0 {
            log::debug!("{} sample waits hit the deadline", events.timeouts);
        }

        for (kind, now, logged) in [
            (SensorKind::Accel, self.snapshot.accel_healthy, &mut self.logged_accel_healthy),
            (SensorKind::Gyro, self.snapshot.gyro_healthy, &mut self.logged_gyro_healthy),
        ] {
            for i in now.difference(*logged).iter() {
                log::info!("{} {} healthy again", kind, i);
            }
            for i in logged.difference(now).iter() {
                log::warn!("{} {} unhealthy", kind, i);
            }
            *logged = now;
        }

        for (k, kind) in [SensorKind::Accel, SensorKind::Gyro].into_iter().enumerate() {
            for i in self.registry.present(kind).iter() {
                let overruns = self.sink.stats(kind, i).overruns;
                let new = overruns.saturating_sub(self.logged_overruns[k][i]);
                if new > 0 {
                    log::warn!("{} {}: {} samples lost to queue overrun", kind, i, new);
                }
                self.logged_overruns[k][i] = overruns;
            }
        }
    }

    #[cfg(feature = "fft")]
    fn track_spectral_peaks(&mut self) {
        if !self.config.fft.drive_notch {
            return;
        }
        let Some(primary) = self.snapshot.first_usable_gyro else {
            return;
        };
        let Some(window) = self.gyros[primary].as_ref().and_then(|g| g.fft_window()) else {
            return;
        };
        let Some(detector) = self.peak_detector.as_mut() else {
            return;
        };
        let Some(peaks) = detector.analyze(window, self.config.fft.min_hz, self.config.fft.max_hz) else {
            return;
        };
        let freqs = crate::fft::notch_frequencies(&peaks, 2.0 * detector.bin_width_hz());
        if freqs.is_empty() {
            return;
        }
        for n in 0..self.config.notches.len() {
            if self.config.notches[n].source == NotchSource::DynamicSet {
                self.set_notch_dynamic_frequencies(n, &freqs);
            }
        }
    }

    // ===== Notch tracking =====

    /// Stage a new reference (e.g. rotor speed in Hz) for a `Reference`
    /// notch; applied at the next update
    pub fn set_notch_reference_hz(&mut self, notch: usize, reference_hz: f64) -> bool {
        let Some(cfg) = self.config.notches.get(notch) else {
            return false;
        };
        let NotchSource::Reference { ratio } = cfg.source else {
            return false;
        };
        if !reference_hz.is_finite() {
            return false;
        }
        self.staged_notch[notch][0] = reference_hz * ratio;
        self.staged_count[notch] = 1;
        self.notch_dirty = true;
        true
    }

    /// Stage a set of measured frequencies for a `DynamicSet` notch. An
    /// empty set falls back to the configured centre.
    pub fn set_notch_dynamic_frequencies(&mut self, notch: usize, freqs: &[f64]) -> bool {
        let Some(cfg) = self.config.notches.get(notch) else {
            return false;
        };
        if cfg.source != NotchSource::DynamicSet {
            return false;
        }
        let center = cfg.center_hz;
        let staged = &mut self.staged_notch[notch];
        let mut count = 0;
        for &f in freqs.iter().filter(|f| f.is_finite() && **f > 0.0).take(MAX_NOTCH_SOURCES) {
            staged[count] = f;
            count += 1;
        }
        if count == 0 {
            staged[0] = center;
            count = 1;
        }
        self.staged_count[notch] = count;
        self.notch_dirty = true;
        true
    }

    /// Fundamental of notch `notch` on the first usable gyro
    pub fn notch_center_hz(&self, notch: usize) -> Option<f64> {
        let primary = self.snapshot.first_usable_gyro?;
        self.gyros[primary].as_ref()?.notch(notch)?.fundamental_hz()
    }

    /// Change the accel low-pass cutoff; 0 selects each backend's default
    pub fn set_accel_filter_hz(&mut self, hz: f64) {
        self.config.accel_filter_hz = hz;
        for (i, slot) in self.registry.iter(SensorKind::Accel) {
            if let Some(ch) = self.accels[i].as_mut() {
                ch.set_filter_hz(filter_hz(hz, slot));
            }
        }
    }

    pub fn set_gyro_filter_hz(&mut self, hz: f64) {
        self.config.gyro_filter_hz = hz;
        for (i, slot) in self.registry.iter(SensorKind::Gyro) {
            if let Some(ch) = self.gyros[i].as_mut() {
                ch.set_filter_hz(filter_hz(hz, slot));
            }
        }
    }

    /// Drop every sample from IMU `instance` (accel and gyro) while set
    pub fn kill_imu(&mut self, instance: usize, kill: bool) {
        if instance >= MAX_INSTANCES {
            return;
        }
        self.killed.set(instance, kill);
        log::info!("imu {} {}", instance, if kill { "killed" } else { "restored" });
    }

    // ===== Accessors =====

    pub fn config(&self) -> &InsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn params(&self) -> &dyn ParamStore {
        self.params.as_ref()
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn loop_rate_hz(&self) -> f64 {
        self.config.loop_rate_hz
    }

    pub fn accel_count(&self) -> usize {
        self.registry.count(SensorKind::Accel)
    }

    pub fn gyro_count(&self) -> usize {
        self.registry.count(SensorKind::Gyro)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Cloneable reader for other threads
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    pub fn delta_time(&self) -> f64 {
        self.snapshot.delta_time
    }

    pub fn accel(&self, instance: usize) -> Vec3 {
        self.snapshot.accel.get(instance).copied().unwrap_or_else(Vec3::zeros)
    }

    pub fn gyro(&self, instance: usize) -> Vec3 {
        self.snapshot.gyro.get(instance).copied().unwrap_or_else(Vec3::zeros)
    }

    pub fn first_usable_accel(&self) -> Option<usize> {
        self.snapshot.first_usable_accel
    }

    pub fn first_usable_gyro(&self) -> Option<usize> {
        self.snapshot.first_usable_gyro
    }

    /// Filtered accel of the first usable instance
    pub fn primary_accel(&self) -> Vec3 {
        self.snapshot.first_usable_accel.map_or_else(Vec3::zeros, |i| self.accel(i))
    }

    pub fn primary_gyro(&self) -> Vec3 {
        self.snapshot.first_usable_gyro.map_or_else(Vec3::zeros, |i| self.gyro(i))
    }

    /// Delta angle (rad) and its integration time, if this cycle had samples
    pub fn delta_angle(&self, instance: usize) -> Option<(Vec3, f64)> {
        let s = &self.snapshot;
        (instance < MAX_INSTANCES && s.delta_angle_valid[instance])
            .then(|| (s.delta_angle[instance], s.delta_angle_dt[instance]))
    }

    pub fn delta_velocity(&self, instance: usize) -> Option<(Vec3, f64)> {
        let s = &self.snapshot;
        (instance < MAX_INSTANCES && s.delta_velocity_valid[instance])
            .then(|| (s.delta_velocity[instance], s.delta_velocity_dt[instance]))
    }

    pub fn accel_healthy(&self, instance: usize) -> bool {
        self.snapshot.accel_healthy.contains(instance)
    }

    pub fn gyro_healthy(&self, instance: usize) -> bool {
        self.snapshot.gyro_healthy.contains(instance)
    }

    pub fn all_accels_healthy(&self) -> bool {
        !self.snapshot.accel_present.is_empty() && self.snapshot.accel_healthy == self.snapshot.accel_present
    }

    pub fn all_gyros_healthy(&self) -> bool {
        !self.snapshot.gyro_present.is_empty() && self.snapshot.gyro_healthy == self.snapshot.gyro_present
    }

    pub fn accel_sample_count(&self, instance: usize) -> u64 {
        self.snapshot.accel_sample_count.get(instance).copied().unwrap_or(0)
    }

    pub fn gyro_sample_count(&self, instance: usize) -> u64 {
        self.snapshot.gyro_sample_count.get(instance).copied().unwrap_or(0)
    }

    /// Cumulative backend error count
    pub fn accel_error_count(&self, instance: usize) -> u32 {
        self.sink.stats(SensorKind::Accel, instance).errors
    }

    pub fn gyro_error_count(&self, instance: usize) -> u32 {
        self.sink.stats(SensorKind::Gyro, instance).errors
    }

    /// Healthy accels agree right now
    pub fn accels_consistent(&self) -> bool {
        self.accels_consistent
    }

    pub fn gyros_consistent(&self) -> bool {
        self.gyros_consistent
    }

    /// Healthy accels have agreed for at least `window_ms`
    pub fn accels_consistent_for(&self, window_ms: u64) -> bool {
        self.accel_latch.consistent_for(window_ms, self.clock.now_ms())
    }

    pub fn gyros_consistent_for(&self, window_ms: u64) -> bool {
        self.gyro_latch.consistent_for(window_ms, self.clock.now_ms())
    }

    pub fn vibration_levels(&self, instance: usize) -> Vec3 {
        self.vibration.get(instance).map_or_else(Vec3::zeros, |v| v.levels())
    }

    /// Clipped samples since the last call
    pub fn take_clip_count(&mut self, instance: usize) -> u32 {
        self.vibration.get_mut(instance).map_or(0, |v| v.take_clip_count())
    }

    pub fn clip_total(&self, instance: usize) -> u64 {
        self.vibration.get(instance).map_or(0, |v| v.clip_total())
    }

    /// Most negative X acceleration on the first usable accel, 0 once stale
    pub fn accel_peak_hold_neg_x(&self) -> f64 {
        self.peak_hold.value(self.clock.now_ms())
    }

    /// Vibration on the first usable accel is below the stillness threshold
    pub fn is_still(&self) -> bool {
        let Some(i) = self.snapshot.first_usable_accel else {
            return false;
        };
        let levels = self.vibration_levels(i);
        levels.iter().all(|v| *v < self.config.still_threshold)
    }

    pub fn temperature(&self, instance: usize) -> f64 {
        self.snapshot.accel_temperature.get(instance).copied().unwrap_or(0.0)
    }

    pub fn accel_calibration(&self, instance: usize) -> Option<AccelCalibration> {
        self.accels.get(instance)?.as_ref().map(|c| c.cal)
    }

    pub fn gyro_calibration(&self, instance: usize) -> Option<GyroCalibration> {
        self.gyros.get(instance)?.as_ref().map(|c| c.cal)
    }

    pub fn accel_cal_ok(&self, instance: usize) -> bool {
        self.accel_cal_ok.get(instance).copied().unwrap_or(false)
    }

    pub fn gyro_cal_ok(&self, instance: usize) -> bool {
        self.gyro_cal_ok.get(instance).copied().unwrap_or(false)
    }

    /// IMU position in the body frame, metres
    pub fn imu_position(&self, instance: usize) -> Vec3 {
        self.positions.get(instance).copied().unwrap_or_else(Vec3::zeros)
    }

    /// Roll and pitch trim in radians
    pub fn trim(&self) -> Vec3 {
        self.trim
    }

    pub fn reboot_required(&self) -> bool {
        self.reboot_required
    }

    pub fn sample_sink(&self) -> &SampleSink {
        &self.sink
    }

    // ===== Log taps =====

    /// A new snapshot has been published since the last fetch
    pub fn has_log_data(&self) -> bool {
        self.log_pending
    }

    pub fn take_log_records(&mut self) -> LogRecords {
        let mut records = LogRecords::default();
        if !self.log_pending {
            return records;
        }
        self.log_pending = false;
        let snap = &self.snapshot;
        let present = snap.accel_present.union(snap.gyro_present);
        for i in present.iter() {
            records.imu.push(ImuRecord::from_snapshot(
                snap,
                i,
                self.sink.stats(SensorKind::Accel, i).errors,
                self.sink.stats(SensorKind::Gyro, i).errors,
            ));
        }
        for i in snap.accel_present.iter() {
            records.vibe.push(VibeRecord::new(
                snap.timestamp_us,
                i,
                &self.vibration[i].levels(),
                self.vibration[i].clip_total(),
            ));
        }
        records
    }

    pub fn batch_receiver(&self) -> Receiver<BatchChunk> {
        self.batch.receiver()
    }

    pub fn status(&self) -> InsStatus {
        let snap = &self.snapshot;
        let mut status = InsStatus::new();
        status.loop_rate_hz = self.config.loop_rate_hz;
        status.cycles = snap.cycle;
        status.accel_count = self.accel_count();
        status.gyro_count = self.gyro_count();
        status.first_usable_accel = snap.first_usable_accel;
        status.first_usable_gyro = snap.first_usable_gyro;
        status.accels_consistent = self.accels_consistent;
        status.gyros_consistent = self.gyros_consistent;
        status.is_still = self.is_still();
        status.accel_peak_hold_neg_x = self.accel_peak_hold_neg_x();
        status.calibrating = self.accel_cal.is_some();
        status.reboot_required = self.reboot_required;
        status.trim = to_array(&self.trim);
        status.pre_arm_failures = self.pre_arm_checks().iter().map(|f| f.to_string()).collect();
        for i in snap.accel_present.union(snap.gyro_present).iter() {
            let accel_cal = self.accel_calibration(i).unwrap_or_default();
            let gyro_cal = self.gyro_calibration(i).unwrap_or_default();
            status.instances.push(InstanceStatus {
                instance: i,
                accel_present: snap.accel_present.contains(i),
                gyro_present: snap.gyro_present.contains(i),
                accel_healthy: snap.accel_healthy.contains(i),
                gyro_healthy: snap.gyro_healthy.contains(i),
                accel_samples: snap.accel_sample_count[i],
                gyro_samples: snap.gyro_sample_count[i],
                accel_errors: self.accel_error_count(i),
                gyro_errors: self.gyro_error_count(i),
                accel_rate_hz: self.registry.slot(SensorKind::Accel, i).map_or(0.0, |s| s.raw_rate_hz),
                gyro_rate_hz: self.registry.slot(SensorKind::Gyro, i).map_or(0.0, |s| s.raw_rate_hz),
                vibration: to_array(&self.vibration_levels(i)),
                clip_total: self.clip_total(i),
                accel_cal_ok: self.accel_cal_ok[i],
                gyro_cal_ok: self.gyro_cal_ok[i],
                accel_offset: to_array(&accel_cal.offset),
                accel_scale: to_array(&accel_cal.scale),
                gyro_offset: to_array(&gyro_cal.offset),
                temperature: snap.accel_temperature[i],
            });
        }
        status
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backend::{SimBackend, SimControl, SimImuConfig};
    use crate::clock::SimClock;
    use crate::params::MemoryParamStore;

    pub(crate) struct Rig {
        pub ins: InertialSensor,
        pub clock: SimClock,
        pub controls: Vec<SimControl>,
    }

    impl Rig {
        pub fn run(&mut self, cycles: usize) {
            for _ in 0..cycles {
                self.ins.wait_for_sample();
                self.ins.update();
            }
        }

        pub fn run_with_periodic(&mut self, cycles: usize) {
            for _ in 0..cycles {
                self.ins.wait_for_sample();
                self.ins.update();
                self.ins.periodic();
            }
        }
    }

    pub(crate) fn quiet_config() -> InsConfig {
        InsConfig {
            gyro_cal_timing: GyroCalTiming::Never,
            ..InsConfig::new()
        }
    }

    pub(crate) fn rig_with(
        imus: usize,
        raw_rate_hz: f64,
        config: InsConfig,
        params: MemoryParamStore,
        tweak: impl Fn(usize, &mut SimImuConfig),
    ) -> Rig {
        let clock = SimClock::with_initial(1_000_000);
        let loop_rate = config.loop_rate_hz;
        let mut ins = InertialSensor::new(config, Arc::new(clock.clone()), Box::new(params)).unwrap();
        let mut controls = Vec::new();
        for i in 0..imus {
            let mut cfg = SimImuConfig::new(raw_rate_hz, i as u64 + 1);
            tweak(i, &mut cfg);
            let backend = SimBackend::new(&format!("sim{i}"), cfg);
            controls.push(backend.control());
            ins.add_backend(Box::new(backend)).unwrap();
        }
        ins.init(loop_rate).unwrap();
        Rig { ins, clock, controls }
    }

    pub(crate) fn rig(imus: usize, raw_rate_hz: f64) -> Rig {
        rig_with(imus, raw_rate_hz, quiet_config(), MemoryParamStore::new(), |_, _| {})
    }
}
