pub mod fft_window;
pub mod harmonic;
pub mod low_pass;
pub mod notch;

pub use fft_window::{CapturePoint, FftCaptureConfig, FftCaptureWindow};
pub use harmonic::{HarmonicNotchBank, HarmonicNotchConfig, NotchSource, MAX_NOTCH_SOURCES};
pub use low_pass::{LowPassFilter, LowPassFilter2p};
pub use notch::NotchFilter;
