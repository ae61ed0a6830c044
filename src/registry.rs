//! Instance registry: which backend drives which accel/gyro slot.
//!
//! Slots are handed out during backend detection and frozen once
//! [`Registry::seal`] is called.

use crate::error::{InsError, InsResult};
use crate::instance_set::InstanceSet;
use crate::rotation::Rotation;
use crate::types::{SensorKind, GRAVITY_MSS, MAX_INSTANCES};
use serde::Serialize;

/// Default accel clip limit, just under a 16 g range
pub const DEFAULT_ACCEL_CLIP_MSS: f64 = (16.0 - 0.5) * GRAVITY_MSS;
/// Largest accel offset a calibration may produce unless the backend says otherwise
pub const DEFAULT_MAX_ABS_OFFSET_MSS: f64 = 3.5;
pub const DEFAULT_FILTER_HZ: f64 = 20.0;

/// What a backend declares about one instance
#[derive(Clone, Debug, PartialEq)]
pub struct SensorRegistration {
    pub raw_rate_hz: f64,
    pub persistent_id: u32,
    pub orientation: Rotation,
    /// Readings at or beyond this magnitude on any axis count as clipped
    pub clip_limit: f64,
    pub max_abs_offset: f64,
    /// Cutoff used when the configured filter is 0
    pub default_filter_hz: f64,
}

impl SensorRegistration {
    pub fn accel(raw_rate_hz: f64, persistent_id: u32) -> Self {
        Self {
            raw_rate_hz,
            persistent_id,
            orientation: Rotation::None,
            clip_limit: DEFAULT_ACCEL_CLIP_MSS,
            max_abs_offset: DEFAULT_MAX_ABS_OFFSET_MSS,
            default_filter_hz: DEFAULT_FILTER_HZ,
        }
    }

    pub fn gyro(raw_rate_hz: f64, persistent_id: u32) -> Self {
        Self {
            clip_limit: f64::INFINITY,
            ..Self::accel(raw_rate_hz, persistent_id)
        }
    }

    pub fn with_orientation(mut self, orientation: Rotation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_clip_limit(mut self, clip_limit: f64) -> Self {
        self.clip_limit = clip_limit;
        self
    }
}

/// A registered instance
#[derive(Clone, Debug, Serialize)]
pub struct SensorSlot {
    pub kind: SensorKind,
    pub backend: usize,
    pub persistent_id: u32,
    pub raw_rate_hz: f64,
    /// Raw samples per loop cycle
    pub oversampling: u32,
    /// Raw rate is not a whole multiple of the loop rate
    pub rate_mismatch: bool,
    pub orientation: Rotation,
    pub clip_limit: f64,
    pub max_abs_offset: f64,
    pub default_filter_hz: f64,
    /// The saved calibration for this slot belongs to this sensor
    pub id_matched: bool,
}

/// Over-sampling multiplier and whether the ratio divides evenly
pub fn oversampling_for(raw_rate_hz: f64, loop_rate_hz: f64) -> (u32, bool) {
    let ratio = raw_rate_hz / loop_rate_hz;
    let multiplier = ratio.round().max(1.0);
    let mismatch = ratio < 1.0 || (ratio - multiplier).abs() > 0.01 * multiplier;
    (multiplier as u32, mismatch)
}

#[derive(Debug)]
pub struct Registry {
    loop_rate_hz: f64,
    accels: [Option<SensorSlot>; MAX_INSTANCES],
    gyros: [Option<SensorSlot>; MAX_INSTANCES],
    saved_accel_ids: [Option<u32>; MAX_INSTANCES],
    saved_gyro_ids: [Option<u32>; MAX_INSTANCES],
    backends: Vec<String>,
    sealed: bool,
}

impl Registry {
    pub fn new(loop_rate_hz: f64) -> Self {
        Self {
            loop_rate_hz,
            accels: Default::default(),
            gyros: Default::default(),
            saved_accel_ids: [None; MAX_INSTANCES],
            saved_gyro_ids: [None; MAX_INSTANCES],
            backends: Vec::new(),
            sealed: false,
        }
    }

    /// Ids persisted from a previous boot, used to keep slots stable
    pub fn set_saved_ids(&mut self, kind: SensorKind, ids: [Option<u32>; MAX_INSTANCES]) {
        match kind {
            SensorKind::Accel => self.saved_accel_ids = ids,
            SensorKind::Gyro => self.saved_gyro_ids = ids,
        }
    }

    pub fn add_backend(&mut self, name: &str) -> usize {
        self.backends.push(name.to_string());
        self.backends.len() - 1
    }

    pub fn backend_name(&self, backend: usize) -> Option<&str> {
        self.backends.get(backend).map(String::as_str)
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    fn slots(&self, kind: SensorKind) -> &[Option<SensorSlot>; MAX_INSTANCES] {
        match kind {
            SensorKind::Accel => &self.accels,
            SensorKind::Gyro => &self.gyros,
        }
    }

    fn saved_ids(&self, kind: SensorKind) -> &[Option<u32>; MAX_INSTANCES] {
        match kind {
            SensorKind::Accel => &self.saved_accel_ids,
            SensorKind::Gyro => &self.saved_gyro_ids,
        }
    }

    /// Matching saved id first, then a slot nobody has claimed before, then
    /// any free slot
    fn choose_slot(&self, kind: SensorKind, persistent_id: u32) -> Option<usize> {
        let slots = self.slots(kind);
        let saved = self.saved_ids(kind);
        let free = |i: &usize| slots[*i].is_none();
        (0..MAX_INSTANCES)
            .filter(free)
            .find(|&i| saved[i] == Some(persistent_id))
            .or_else(|| (0..MAX_INSTANCES).filter(free).find(|&i| saved[i].is_none()))
            .or_else(|| (0..MAX_INSTANCES).find(free))
    }

    pub fn register(&mut self, kind: SensorKind, backend: usize, reg: &SensorRegistration) -> InsResult<usize> {
        if self.sealed {
            return Err(InsError::RegistrationClosed);
        }
        if !(reg.raw_rate_hz.is_finite() && reg.raw_rate_hz > 0.0) {
            return Err(InsError::InvalidSampleRate {
                kind,
                rate_hz: reg.raw_rate_hz,
            });
        }
        let instance = self
            .choose_slot(kind, reg.persistent_id)
            .ok_or(InsError::CapacityExhausted(kind))?;
        let (oversampling, rate_mismatch) = oversampling_for(reg.raw_rate_hz, self.loop_rate_hz);
        let slot = SensorSlot {
            kind,
            backend,
            persistent_id: reg.persistent_id,
            raw_rate_hz: reg.raw_rate_hz,
            oversampling,
            rate_mismatch,
            orientation: reg.orientation,
            clip_limit: reg.clip_limit,
            max_abs_offset: reg.max_abs_offset,
            default_filter_hz: reg.default_filter_hz,
            id_matched: self.saved_ids(kind)[instance] == Some(reg.persistent_id),
        };
        match kind {
            SensorKind::Accel => self.accels[instance] = Some(slot),
            SensorKind::Gyro => self.gyros[instance] = Some(slot),
        }
        Ok(instance)
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn loop_rate_hz(&self) -> f64 {
        self.loop_rate_hz
    }

    pub fn slot(&self, kind: SensorKind, instance: usize) -> Option<&SensorSlot> {
        self.slots(kind).get(instance).and_then(Option::as_ref)
    }

    pub fn present(&self, kind: SensorKind) -> InstanceSet {
        let mut set = InstanceSet::empty();
        for (i, slot) in self.slots(kind).iter().enumerate() {
            set.set(i, slot.is_some());
        }
        set
    }

    pub fn count(&self, kind: SensorKind) -> usize {
        self.present(kind).len()
    }

    pub fn rate_mismatches(&self) -> impl Iterator<Item = &SensorSlot> {
        self.accels
            .iter()
            .chain(self.gyros.iter())
            .flatten()
            .filter(|s| s.rate_mismatch)
    }

    /// Instance numbers of a kind, paired with their slot
    pub fn iter(&self, kind: SensorKind) -> impl Iterator<Item = (usize, &SensorSlot)> {
        self.slots(kind)
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }
}

/// Registration handle given to one backend during probing
pub struct Registrar<'a> {
    registry: &'a mut Registry,
    backend: usize,
}

impl<'a> Registrar<'a> {
    pub fn new(registry: &'a mut Registry, backend: usize) -> Self {
        Self { registry, backend }
    }

    pub fn loop_rate_hz(&self) -> f64 {
        self.registry.loop_rate_hz()
    }

    /// Claim an accel slot; on failure `instance` stays unset
    pub fn register_accel(&mut self, instance: &mut Option<usize>, raw_rate_hz: f64, persistent_id: u32) -> bool {
        self.register_with(SensorKind::Accel, instance, &SensorRegistration::accel(raw_rate_hz, persistent_id))
    }

    /// Claim a gyro slot; on failure `instance` stays unset
    pub fn register_gyro(&mut self, instance: &mut Option<usize>, raw_rate_hz: f64, persistent_id: u32) -> bool {
        self.register_with(SensorKind::Gyro, instance, &SensorRegistration::gyro(raw_rate_hz, persistent_id))
    }

    pub fn register_with(&mut self, kind: SensorKind, instance: &mut Option<usize>, reg: &SensorRegistration) -> bool {
        match self.registry.register(kind, self.backend, reg) {
            Ok(i) => {
                *instance = Some(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn register(&mut self, kind: SensorKind, reg: &SensorRegistration) -> InsResult<usize> {
        self.registry.register(kind, self.backend, reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_slot_then_capacity() {
        let mut registry = Registry::new(400.0);
        let b = registry.add_backend("imu");
        let mut reg = Registrar::new(&mut registry, b);
        let mut ids = Vec::new();
        for id in 0..MAX_INSTANCES as u32 {
            let mut instance = None;
            assert!(reg.register_accel(&mut instance, 1000.0, 100 + id));
            ids.push(instance.unwrap());
        }
        assert_eq!(ids, (0..MAX_INSTANCES).collect::<Vec<_>>());

        let mut instance = None;
        assert!(!reg.register_accel(&mut instance, 1000.0, 999));
        assert!(instance.is_none());
        assert!(matches!(
            registry.register(SensorKind::Accel, b, &SensorRegistration::accel(1000.0, 1)),
            Err(InsError::CapacityExhausted(SensorKind::Accel))
        ));
    }

    #[test]
    fn test_saved_ids_keep_slots_stable() {
        let mut registry = Registry::new(400.0);
        registry.set_saved_ids(SensorKind::Gyro, [Some(11), Some(22), None]);
        let b = registry.add_backend("imu");
        // Second sensor probes first but still lands in its old slot
        let second = registry.register(SensorKind::Gyro, b, &SensorRegistration::gyro(1000.0, 22)).unwrap();
        let new = registry.register(SensorKind::Gyro, b, &SensorRegistration::gyro(1000.0, 33)).unwrap();
        let first = registry.register(SensorKind::Gyro, b, &SensorRegistration::gyro(1000.0, 11)).unwrap();
        assert_eq!((first, second, new), (0, 1, 2));
        assert!(registry.slot(SensorKind::Gyro, 1).unwrap().id_matched);
        assert!(!registry.slot(SensorKind::Gyro, 2).unwrap().id_matched);
    }

    #[test]
    fn test_sealed_registry_rejects() {
        let mut registry = Registry::new(400.0);
        registry.seal();
        let mut instance = None;
        let mut reg = Registrar::new(&mut registry, 0);
        assert!(!reg.register_gyro(&mut instance, 1000.0, 1));
        assert!(matches!(
            registry.register(SensorKind::Gyro, 0, &SensorRegistration::gyro(1000.0, 1)),
            Err(InsError::RegistrationClosed)
        ));
    }

    #[test]
    fn test_oversampling_multiplier() {
        assert_eq!(oversampling_for(2000.0, 400.0), (5, false));
        assert_eq!(oversampling_for(400.0, 400.0), (1, false));
        assert_eq!(oversampling_for(1000.0, 400.0), (3, true));
        assert_eq!(oversampling_for(200.0, 400.0), (1, true));
    }

    #[test]
    fn test_rate_mismatch_listed() {
        let mut registry = Registry::new(400.0);
        registry.register(SensorKind::Accel, 0, &SensorRegistration::accel(1000.0, 1)).unwrap();
        registry.register(SensorKind::Gyro, 0, &SensorRegistration::gyro(2000.0, 1)).unwrap();
        let mismatched: Vec<_> = registry.rate_mismatches().map(|s| s.kind).collect();
        assert_eq!(mismatched, vec![SensorKind::Accel]);
        assert_eq!(registry.present(SensorKind::Accel), InstanceSet::from_ids(&[0]));
    }
}
