use crate::types::Vec3;
use std::f64::consts::PI;

/// Largest fractional centre-frequency move allowed per retune
pub const NOTCH_MAX_SLEW: f64 = 0.05;

/// Convert attenuation and bandwidth into the (A, Q) pair of the biquad
pub fn attenuation_and_q(center_hz: f64, bandwidth_hz: f64, attenuation_db: f64) -> (f64, f64) {
    let a = 10f64.powf(-attenuation_db / 40.0);
    let q = if center_hz > 0.5 * bandwidth_hz {
        let octaves = (center_hz / (center_hz - bandwidth_hz / 2.0)).log2() * 2.0;
        2f64.powf(octaves).sqrt() / (2f64.powf(octaves) - 1.0)
    } else {
        0.0
    };
    (a, q)
}

#[derive(Clone, Copy, Debug, Default)]
struct NotchCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    a0_inv: f64,
}

/// Single notch over a 3-vector
#[derive(Clone, Debug, Default)]
pub struct NotchFilter {
    coeffs: NotchCoeffs,
    center_hz: f64,
    sample_hz: f64,
    active: bool,
    need_reset: bool,
    input1: Vec3,
    input2: Vec3,
    output1: Vec3,
    output2: Vec3,
}

impl NotchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self, sample_hz: f64, center_hz: f64, bandwidth_hz: f64, attenuation_db: f64) {
        let (a, q) = attenuation_and_q(center_hz, bandwidth_hz, attenuation_db);
        self.init_with_a_and_q(sample_hz, center_hz, a, q);
    }

    /// Retune, limiting how far the centre moves from the current one
    pub fn init_with_a_and_q(&mut self, sample_hz: f64, center_hz: f64, a: f64, q: f64) {
        if !(center_hz > 0.0 && center_hz < 0.5 * sample_hz && q > 0.0) {
            self.active = false;
            return;
        }
        let mut center = center_hz;
        if self.active && self.center_hz > 0.0 {
            center = center.clamp(
                self.center_hz * (1.0 - NOTCH_MAX_SLEW),
                self.center_hz * (1.0 + NOTCH_MAX_SLEW),
            );
        } else {
            self.need_reset = true;
        }
        let omega = 2.0 * PI * center / sample_hz;
        let alpha = omega.sin() / (2.0 * q);
        self.coeffs = NotchCoeffs {
            b0: 1.0 + alpha * a * a,
            b1: -2.0 * omega.cos(),
            b2: 1.0 - alpha * a * a,
            a1: -2.0 * omega.cos(),
            a2: 1.0 - alpha,
            a0_inv: 1.0 / (1.0 + alpha),
        };
        self.center_hz = center;
        self.sample_hz = sample_hz;
        self.active = true;
    }

    pub fn disable(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn center_hz(&self) -> f64 {
        self.center_hz
    }

    pub fn apply(&mut self, sample: &Vec3) -> Vec3 {
        if !self.active {
            return *sample;
        }
        if self.need_reset {
            self.reset(sample);
        }
        let c = &self.coeffs;
        let output = (sample * c.b0 + self.input1 * c.b1 + self.input2 * c.b2
            - self.output1 * c.a1
            - self.output2 * c.a2)
            * c.a0_inv;
        self.input2 = self.input1;
        self.input1 = *sample;
        self.output2 = self.output1;
        self.output1 = output;
        output
    }

    pub fn reset(&mut self, value: &Vec3) {
        self.input1 = *value;
        self.input2 = *value;
        self.output1 = *value;
        self.output2 = *value;
        self.need_reset = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady_amplitude(notch: &mut NotchFilter, sample_hz: f64, freq_hz: f64) -> f64 {
        let n = (sample_hz * 2.0) as usize;
        let mut peak: f64 = 0.0;
        for i in 0..n {
            let t = i as f64 / sample_hz;
            let out = notch.apply(&Vec3::new(0.0, (2.0 * PI * freq_hz * t).sin(), 0.0));
            if i > n / 2 {
                peak = peak.max(out.y.abs());
            }
        }
        peak
    }

    #[test]
    fn test_a_and_q_conversion() {
        let (a, q) = attenuation_and_q(80.0, 40.0, 40.0);
        assert!((a - 0.1).abs() < 1e-12);
        assert!(q > 1.0 && q < 3.0, "q = {q}");
        let (_, q) = attenuation_and_q(10.0, 40.0, 40.0);
        assert_eq!(q, 0.0);
    }

    #[test]
    fn test_attenuates_centre_and_passes_elsewhere() {
        let mut notch = NotchFilter::new();
        notch.init(1000.0, 80.0, 20.0, 40.0);
        let at_center = steady_amplitude(&mut notch, 1000.0, 80.0);
        let mut notch = NotchFilter::new();
        notch.init(1000.0, 80.0, 20.0, 40.0);
        let away = steady_amplitude(&mut notch, 1000.0, 5.0);
        assert!(at_center < 0.05, "centre gain {at_center}");
        assert!(away > 0.95, "passband gain {away}");
    }

    #[test]
    fn test_retune_is_slew_limited() {
        let mut notch = NotchFilter::new();
        notch.init(1000.0, 100.0, 20.0, 30.0);
        notch.init(1000.0, 200.0, 20.0, 30.0);
        assert!((notch.center_hz() - 105.0).abs() < 1e-9);
        notch.init(1000.0, 50.0, 20.0, 30.0);
        assert!((notch.center_hz() - 99.75).abs() < 1e-9);
    }

    #[test]
    fn test_above_nyquist_disables() {
        let mut notch = NotchFilter::new();
        notch.init(400.0, 250.0, 40.0, 40.0);
        assert!(!notch.is_active());
        let v = Vec3::new(1.0, 2.0, 3.0);
        assert_eq!(notch.apply(&v), v);
    }
}
