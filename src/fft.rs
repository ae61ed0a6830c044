//! Spectral peak detection over the gyro capture windows.
//!
//! Runs from `periodic()`, never from the sample loop. Detected peaks can
//! retune notches whose source is `DynamicSet`.

use crate::filters::FftCaptureWindow;
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// Strongest frequency on one axis
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakEstimate {
    pub axis: usize,
    pub freq_hz: f64,
    pub magnitude: f64,
}

pub struct PeakDetector {
    size: usize,
    sample_hz: f64,
    fft: Arc<dyn Fft<f64>>,
    hann_window: Vec<f64>,
    axis_buf: Vec<f64>,
    spectrum: Vec<Complex<f64>>,
}

impl PeakDetector {
    pub fn new(window_size: usize, sample_hz: f64) -> Self {
        let size = window_size.max(2).next_power_of_two();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let hann_window = (0..size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (size - 1) as f64).cos()))
            .collect();
        Self {
            size,
            sample_hz,
            fft,
            hann_window,
            axis_buf: Vec::with_capacity(size),
            spectrum: vec![Complex::new(0.0, 0.0); size],
        }
    }

    pub fn bin_width_hz(&self) -> f64 {
        self.sample_hz / self.size as f64
    }

    /// Peak per axis within `[min_hz, max_hz]`; None until the window is full
    pub fn analyze(&mut self, window: &FftCaptureWindow, min_hz: f64, max_hz: f64) -> Option<[Option<PeakEstimate>; 3]> {
        if !window.is_full() || window.size() != self.size {
            return None;
        }
        let mut peaks = [None; 3];
        for (axis, peak) in peaks.iter_mut().enumerate() {
            window.copy_axis(axis, &mut self.axis_buf);
            *peak = self.axis_peak(axis, min_hz, max_hz);
        }
        Some(peaks)
    }

    fn axis_peak(&mut self, axis: usize, min_hz: f64, max_hz: f64) -> Option<PeakEstimate> {
        let mean = self.axis_buf.iter().sum::<f64>() / self.size as f64;
        for (i, (out, v)) in self.spectrum.iter_mut().zip(self.axis_buf.iter()).enumerate() {
            *out = Complex::new((v - mean) * self.hann_window[i], 0.0);
        }
        self.fft.process(&mut self.spectrum);

        let bin_hz = self.bin_width_hz();
        let half = self.size / 2;
        let lo = ((min_hz / bin_hz).ceil() as usize).max(1);
        let hi = ((max_hz / bin_hz).floor() as usize).min(half - 1);
        if lo > hi {
            return None;
        }
        let mags: Vec<f64> = self.spectrum[..=half].iter().map(|c| c.norm()).collect();
        let (bin, magnitude) = (lo..=hi)
            .map(|b| (b, mags[b]))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        if magnitude <= f64::EPSILON {
            return None;
        }
        // Parabolic interpolation between neighbouring bins
        let (l, c, r) = (mags[bin - 1], mags[bin], mags[bin + 1]);
        let denom = l - 2.0 * c + r;
        let offset = if denom.abs() > f64::EPSILON {
            (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        Some(PeakEstimate {
            axis,
            freq_hz: (bin as f64 + offset) * bin_hz,
            magnitude,
        })
    }
}

/// Frequencies of the strongest peaks, largest first, without near duplicates
pub fn notch_frequencies(peaks: &[Option<PeakEstimate>; 3], min_separation_hz: f64) -> Vec<f64> {
    let mut sorted: Vec<PeakEstimate> = peaks.iter().flatten().copied().collect();
    sorted.sort_by(|a, b| b.magnitude.total_cmp(&a.magnitude));
    let mut out: Vec<f64> = Vec::new();
    for p in sorted {
        if out.iter().all(|f| (f - p.freq_hz).abs() >= min_separation_hz) {
            out.push(p.freq_hz);
        }
    }
    out
}
