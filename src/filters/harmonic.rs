//! Harmonic notch bank: one notch per (source frequency, harmonic).

use super::notch::{attenuation_and_q, NotchFilter};
use crate::types::Vec3;
use serde::{Deserialize, Serialize};

/// Most simultaneous source frequencies (e.g. one per motor)
pub const MAX_NOTCH_SOURCES: usize = 4;
/// Harmonics are selected by the low bits of an 8-bit mask
pub const MAX_HARMONICS: u32 = 8;

/// Where the notch centre comes from
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotchSource {
    /// Always the configured centre
    Fixed,
    /// External reference (e.g. rotor speed in Hz) times `ratio`
    Reference { ratio: f64 },
    /// A set of measured frequencies (ESC telemetry or spectral peaks)
    DynamicSet,
}

impl Default for NotchSource {
    fn default() -> Self {
        NotchSource::Fixed
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonicNotchConfig {
    pub enabled: bool,
    pub source: NotchSource,
    pub center_hz: f64,
    pub bandwidth_hz: f64,
    pub attenuation_db: f64,
    /// Bit n enables harmonic n+1
    pub harmonics: u8,
    /// Tracked frequencies are held at or above `center_hz * min_ratio`
    pub min_ratio: f64,
}

impl HarmonicNotchConfig {
    pub fn new() -> Self {
        Self {
            enabled: false,
            source: NotchSource::Fixed,
            center_hz: 80.0,
            bandwidth_hz: 40.0,
            attenuation_db: 40.0,
            harmonics: 0b11,
            min_ratio: 1.0,
        }
    }

    /// Harmonic numbers enabled by the mask, ascending
    pub fn harmonic_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_HARMONICS)
            .filter(move |bit| self.harmonics & (1 << bit) != 0)
            .map(|bit| bit + 1)
    }

    pub fn harmonic_count(&self) -> usize {
        self.harmonics.count_ones() as usize
    }

    pub fn min_hz(&self) -> f64 {
        self.center_hz * self.min_ratio
    }

    /// Enabled harmonics of the configured centre lying at or above `limit_hz`
    pub fn harmonics_above(&self, limit_hz: f64) -> Vec<(u32, f64)> {
        if !self.enabled {
            return Vec::new();
        }
        self.harmonic_numbers()
            .map(|h| (h, self.center_hz * h as f64))
            .filter(|(_, f)| *f >= limit_hz)
            .collect()
    }
}

impl Default for HarmonicNotchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-instance bank, allocated once and retuned in place
#[derive(Clone, Debug)]
pub struct HarmonicNotchBank {
    config: HarmonicNotchConfig,
    sample_hz: f64,
    a: f64,
    q: f64,
    filters: Vec<NotchFilter>,
    active_sources: usize,
}

impl HarmonicNotchBank {
    pub fn new(config: &HarmonicNotchConfig, sample_hz: f64) -> Self {
        let (a, q) = attenuation_and_q(config.center_hz, config.bandwidth_hz, config.attenuation_db);
        let count = if config.enabled {
            MAX_NOTCH_SOURCES * config.harmonic_count()
        } else {
            0
        };
        let mut bank = Self {
            config: config.clone(),
            sample_hz,
            a,
            q,
            filters: vec![NotchFilter::new(); count],
            active_sources: 0,
        };
        bank.update(&[config.center_hz]);
        bank
    }

    pub fn config(&self) -> &HarmonicNotchConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        !self.filters.is_empty()
    }

    /// Retune to a new set of source frequencies (extra sources are ignored)
    pub fn update(&mut self, source_hz: &[f64]) {
        if self.filters.is_empty() {
            return;
        }
        let harmonics = self.config.harmonic_count();
        let min_hz = self.config.min_hz();
        let sources = source_hz.len().min(MAX_NOTCH_SOURCES);
        for (s, &freq) in source_hz.iter().take(sources).enumerate() {
            let base = if freq.is_finite() { freq.max(min_hz) } else { min_hz };
            for (k, h) in self.config.harmonic_numbers().enumerate() {
                self.filters[s * harmonics + k].init_with_a_and_q(
                    self.sample_hz,
                    base * h as f64,
                    self.a,
                    self.q,
                );
            }
        }
        for filter in self.filters.iter_mut().skip(sources * harmonics) {
            filter.disable();
        }
        self.active_sources = sources;
    }

    pub fn apply(&mut self, sample: &Vec3) -> Vec3 {
        let mut out = *sample;
        for filter in self.filters.iter_mut() {
            out = filter.apply(&out);
        }
        out
    }

    pub fn active_filters(&self) -> usize {
        self.filters.iter().filter(|f| f.is_active()).count()
    }

    /// Centre of the fundamental for the first source
    pub fn fundamental_hz(&self) -> Option<f64> {
        self.filters
            .first()
            .filter(|f| f.is_active())
            .map(|f| f.center_hz())
    }

    pub fn active_sources(&self) -> usize {
        self.active_sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> HarmonicNotchConfig {
        HarmonicNotchConfig {
            enabled: true,
            ..HarmonicNotchConfig::new()
        }
    }

    #[test]
    fn test_harmonic_mask_expands() {
        let mut cfg = enabled_config();
        cfg.harmonics = 0b101;
        assert_eq!(cfg.harmonic_numbers().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(cfg.harmonic_count(), 2);
    }

    #[test]
    fn test_disabled_bank_is_passthrough() {
        let mut bank = HarmonicNotchBank::new(&HarmonicNotchConfig::new(), 1000.0);
        assert!(!bank.is_enabled());
        let v = Vec3::new(0.1, 0.2, 0.3);
        assert_eq!(bank.apply(&v), v);
    }

    #[test]
    fn test_harmonics_above_nyquist_are_inactive() {
        // 80 Hz and 160 Hz with a 250 Hz Nyquist; third harmonic 240 Hz still fits
        let mut cfg = enabled_config();
        cfg.harmonics = 0b1111;
        let bank = HarmonicNotchBank::new(&cfg, 500.0);
        assert_eq!(bank.active_filters(), 3);
        assert_eq!(cfg.harmonics_above(200.0), vec![(3, 240.0), (4, 320.0)]);
    }

    #[test]
    fn test_tracking_respects_min_ratio_and_sources() {
        let mut cfg = enabled_config();
        cfg.source = NotchSource::DynamicSet;
        cfg.min_ratio = 0.5;
        let mut bank = HarmonicNotchBank::new(&cfg, 2000.0);
        assert_eq!(bank.active_sources(), 1);
        // Step far below the floor: clamped to 40 Hz, then slewed from 80 Hz
        bank.update(&[10.0, 82.0]);
        assert_eq!(bank.active_sources(), 2);
        assert!((bank.fundamental_hz().unwrap_or(0.0) - 76.0).abs() < 1e-9);
        assert_eq!(bank.active_filters(), 4);
        bank.update(&[]);
        assert_eq!(bank.active_filters(), 0);
    }
}
