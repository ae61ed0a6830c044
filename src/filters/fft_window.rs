use crate::types::Vec3;
use serde::{Deserialize, Serialize};

/// Which side of the filter chain feeds the capture buffers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapturePoint {
    #[default]
    PreFilter,
    PostFilter,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FftCaptureConfig {
    pub enabled: bool,
    /// Rounded up to a power of two
    pub window_size: usize,
    pub capture: CapturePoint,
    /// Peak search range for the optional detector
    pub min_hz: f64,
    pub max_hz: f64,
    /// Feed detected peaks to notches whose source is `DynamicSet`
    pub drive_notch: bool,
}

impl Default for FftCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_size: 256,
            capture: CapturePoint::PreFilter,
            min_hz: 30.0,
            max_hz: 400.0,
            drive_notch: false,
        }
    }
}

/// Per-axis ring buffers of gyro samples, lossy and fixed size
#[derive(Clone, Debug)]
pub struct FftCaptureWindow {
    axes: [Vec<f64>; 3],
    size: usize,
    write: usize,
    total: u64,
}

impl FftCaptureWindow {
    pub fn new(window_size: usize) -> Self {
        let size = window_size.max(2).next_power_of_two();
        Self {
            axes: [vec![0.0; size], vec![0.0; size], vec![0.0; size]],
            size,
            write: 0,
            total: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Overwrites the oldest sample once full
    pub fn push(&mut self, sample: &Vec3) {
        for (axis, buf) in self.axes.iter_mut().enumerate() {
            buf[self.write] = sample[axis];
        }
        self.write = (self.write + 1) & (self.size - 1);
        self.total += 1;
    }

    pub fn is_full(&self) -> bool {
        self.total >= self.size as u64
    }

    pub fn samples_pushed(&self) -> u64 {
        self.total
    }

    /// Copy one axis out oldest-first into `out`
    pub fn copy_axis(&self, axis: usize, out: &mut Vec<f64>) {
        out.clear();
        let Some(buf) = self.axes.get(axis) else {
            return;
        };
        if self.is_full() {
            out.extend_from_slice(&buf[self.write..]);
            out.extend_from_slice(&buf[..self.write]);
        } else {
            out.extend_from_slice(&buf[..self.write]);
        }
    }
}
