//! Vibration levels, clipping and the negative-X peak hold.

use crate::filters::LowPassFilter;
use crate::types::Vec3;

pub const VIBE_FLOOR_HZ: f64 = 5.0;
pub const VIBE_HZ: f64 = 2.0;
pub const PEAK_HOLD_TIMEOUT_MS: u64 = 500;

/// Vibration state for one accelerometer, fed every raw sample
#[derive(Clone, Debug)]
pub struct VibrationMonitor {
    floor: LowPassFilter,
    vibe: LowPassFilter,
    primed: bool,
    clip_count: u32,
    clip_total: u64,
}

impl VibrationMonitor {
    pub fn new() -> Self {
        Self {
            floor: LowPassFilter::new(VIBE_FLOOR_HZ),
            vibe: LowPassFilter::new(VIBE_HZ),
            primed: false,
            clip_count: 0,
            clip_total: 0,
        }
    }

    pub fn apply(&mut self, accel: &Vec3, dt: f64, clip_limit: f64) {
        if accel.iter().any(|a| a.abs() >= clip_limit) {
            self.clip_count = self.clip_count.saturating_add(1);
            self.clip_total += 1;
        }
        if !self.primed {
            self.floor.reset_to(accel);
            self.primed = true;
        }
        let floor = self.floor.apply(accel, dt);
        let diff = accel - floor;
        self.vibe.apply(&diff.component_mul(&diff), dt);
    }

    /// Per-axis vibration in m/s²
    pub fn levels(&self) -> Vec3 {
        self.vibe.output().map(|v| v.max(0.0).sqrt())
    }

    /// Clipped samples since the last read
    pub fn take_clip_count(&mut self) -> u32 {
        std::mem::take(&mut self.clip_count)
    }

    pub fn clip_count(&self) -> u32 {
        self.clip_count
    }

    pub fn clip_total(&self) -> u64 {
        self.clip_total
    }
}

impl Default for VibrationMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Most negative X acceleration, forgotten after a timeout
#[derive(Clone, Copy, Debug, Default)]
pub struct PeakHold {
    value: f64,
    expires_ms: u64,
}

impl PeakHold {
    pub fn update(&mut self, x: f64, now_ms: u64) {
        if x < self.value || now_ms >= self.expires_ms {
            self.value = x;
            self.expires_ms = now_ms + PEAK_HOLD_TIMEOUT_MS;
        }
    }

    pub fn value(&self, now_ms: u64) -> f64 {
        if now_ms < self.expires_ms {
            self.value.min(0.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_still_sensor_reads_low_vibration() {
        let mut vibe = VibrationMonitor::new();
        for _ in 0..2000 {
            vibe.apply(&Vec3::new(0.0, 0.0, -9.8), 0.001, 150.0);
        }
        assert!(vibe.levels().norm() < 1e-6);
    }

    #[test]
    fn test_shaking_raises_vibration() {
        let mut vibe = VibrationMonitor::new();
        for i in 0..4000 {
            let t = i as f64 * 0.001;
            let x = 4.0 * (2.0 * PI * 80.0 * t).sin();
            vibe.apply(&Vec3::new(x, 0.0, -9.8), 0.001, 150.0);
        }
        let levels = vibe.levels();
        // RMS of a 4 m/s² sine
        assert!((levels.x - 4.0 / 2f64.sqrt()).abs() < 0.5, "level {}", levels.x);
        assert!(levels.y < 1e-6);
    }

    #[test]
    fn test_clip_count_read_and_clear() {
        let mut vibe = VibrationMonitor::new();
        for _ in 0..7 {
            vibe.apply(&Vec3::new(160.0, 0.0, 0.0), 0.001, 150.0);
        }
        vibe.apply(&Vec3::new(10.0, 0.0, 0.0), 0.001, 150.0);
        assert_eq!(vibe.take_clip_count(), 7);
        assert_eq!(vibe.take_clip_count(), 0);
        assert_eq!(vibe.clip_total(), 7);
    }

    #[test]
    fn test_peak_hold_times_out() {
        let mut peak = PeakHold::default();
        peak.update(-30.0, 1000);
        peak.update(-5.0, 1100);
        assert_eq!(peak.value(1200), -30.0);
        assert_eq!(peak.value(1500), 0.0);
        peak.update(-2.0, 1600);
        assert_eq!(peak.value(1700), -2.0);
    }
}
