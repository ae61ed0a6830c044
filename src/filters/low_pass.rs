use crate::types::Vec3;
use std::f64::consts::PI;

/// Second-order Butterworth coefficients for a given sample rate and cutoff
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BiquadParams {
    pub cutoff_hz: f64,
    pub sample_hz: f64,
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl BiquadParams {
    pub fn new(sample_hz: f64, cutoff_hz: f64) -> Self {
        let mut p = Self {
            cutoff_hz,
            sample_hz,
            ..Self::default()
        };
        if !p.is_active() {
            return p;
        }
        let fr = sample_hz / cutoff_hz;
        let ohm = (PI / fr).tan();
        let c = 1.0 + 2.0 * (PI / 4.0).cos() * ohm + ohm * ohm;
        p.b0 = ohm * ohm / c;
        p.b1 = 2.0 * p.b0;
        p.b2 = p.b0;
        p.a1 = 2.0 * (ohm * ohm - 1.0) / c;
        p.a2 = (1.0 - 2.0 * (PI / 4.0).cos() * ohm + ohm * ohm) / c;
        p
    }

    /// Cutoffs at or above Nyquist fall back to pass-through
    pub fn is_active(&self) -> bool {
        self.cutoff_hz > 0.0 && self.sample_hz > 0.0 && self.cutoff_hz < 0.5 * self.sample_hz
    }
}

/// Two-pole low-pass filter over a 3-vector
#[derive(Clone, Debug, Default)]
pub struct LowPassFilter2p {
    params: BiquadParams,
    delay1: Vec3,
    delay2: Vec3,
    primed: bool,
}

impl LowPassFilter2p {
    pub fn new(sample_hz: f64, cutoff_hz: f64) -> Self {
        Self {
            params: BiquadParams::new(sample_hz, cutoff_hz),
            ..Self::default()
        }
    }

    /// Retune without reallocating; the next sample re-primes the state
    pub fn set_cutoff(&mut self, sample_hz: f64, cutoff_hz: f64) {
        self.params = BiquadParams::new(sample_hz, cutoff_hz);
        self.primed = false;
    }

    pub fn cutoff_hz(&self) -> f64 {
        self.params.cutoff_hz
    }

    pub fn apply(&mut self, sample: &Vec3) -> Vec3 {
        if !self.params.is_active() {
            return *sample;
        }
        if !self.primed {
            self.reset(sample);
        }
        let p = &self.params;
        let delay0 = sample - self.delay1 * p.a1 - self.delay2 * p.a2;
        let output = delay0 * p.b0 + self.delay1 * p.b1 + self.delay2 * p.b2;
        self.delay2 = self.delay1;
        self.delay1 = delay0;
        output
    }

    /// Settle the filter so a constant `value` passes straight through
    pub fn reset(&mut self, value: &Vec3) {
        let p = &self.params;
        let denom = 1.0 + p.a1 + p.a2;
        let settled = if denom.abs() > f64::EPSILON {
            value / denom
        } else {
            *value
        };
        self.delay1 = settled;
        self.delay2 = settled;
        self.primed = true;
    }
}

/// First-order low-pass filter, variable dt
#[derive(Clone, Debug, Default)]
pub struct LowPassFilter {
    cutoff_hz: f64,
    output: Vec3,
}

impl LowPassFilter {
    pub fn new(cutoff_hz: f64) -> Self {
        Self {
            cutoff_hz,
            output: Vec3::zeros(),
        }
    }

    pub fn apply(&mut self, sample: &Vec3, dt: f64) -> Vec3 {
        if self.cutoff_hz <= 0.0 || dt <= 0.0 {
            self.output = *sample;
            return self.output;
        }
        let rc = 1.0 / (2.0 * PI * self.cutoff_hz);
        let alpha = (dt / (dt + rc)).clamp(0.0, 1.0);
        self.output += (sample - self.output) * alpha;
        self.output
    }

    pub fn output(&self) -> Vec3 {
        self.output
    }

    pub fn reset(&mut self) {
        self.output = Vec3::zeros();
    }

    pub fn reset_to(&mut self, value: &Vec3) {
        self.output = *value;
    }
}
