use crate::types::SensorKind;
use thiserror::Error;

/// Inertial sensor error types
#[derive(Error, Debug)]
pub enum InsError {
    #[error("no free {0} instance slot")]
    CapacityExhausted(SensorKind),

    #[error("backend registration is closed")]
    RegistrationClosed,

    #[error("invalid loop rate: {0} Hz")]
    InvalidLoopRate(f64),

    #[error("invalid sample rate for {kind} registration: {rate_hz} Hz")]
    InvalidSampleRate { kind: SensorKind, rate_hz: f64 },

    #[error("unknown {kind} instance {instance}")]
    UnknownInstance { kind: SensorKind, instance: usize },

    #[error("inertial sensor not initialised")]
    NotInitialised,

    #[error("a calibration is already running")]
    CalibrationBusy,

    #[error("backend {name} failed to probe: {reason}")]
    Probe { name: String, reason: String },

    #[error("parameter error: {0}")]
    Param(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for inertial sensor operations
pub type InsResult<T> = Result<T, InsError>;

/// Reasons a calibration routine refuses to produce a result
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum CalFailure {
    #[error("vehicle moved during calibration")]
    NotStill,

    #[error("calibration fit did not converge")]
    Divergent,

    #[error("fit residual {0:.3} m/s² above tolerance")]
    PoorFit(f64),

    #[error("offset change on axis {axis} of {change:.3} exceeds limit")]
    OffsetChangeExceeded { axis: usize, change: f64 },

    #[error("offset {0:.3} out of range")]
    OffsetOutOfRange(f64),

    #[error("scale factor {0:.3} out of range")]
    ScaleOutOfRange(f64),

    #[error("cross-axis term {0:.3} out of range")]
    CrossAxisOutOfRange(f64),

    #[error("sample too close to a previous orientation")]
    SampleTooClose,

    #[error("not enough samples: have {have}, need {need}")]
    NotEnoughSamples { have: usize, need: usize },

    #[error("normal matrix is singular")]
    Singular,

    #[error("trim angle {0:.1} deg out of range")]
    TrimOutOfRange(f64),

    #[error("calibration timed out")]
    Timeout,

    #[error("calibration aborted")]
    Aborted,

    #[error("calibration already running")]
    Busy,

    #[error("no sensor available for calibration")]
    NoSensor,

    #[error("no accel calibration in progress")]
    NoSession,
}

/// Operator-facing outcome of a calibration command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalResult {
    Success,
    InProgress,
    Failed(CalFailure),
    RequiresReboot,
}

impl CalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CalResult::Success | CalResult::RequiresReboot)
    }
}

/// Findings that block arming
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreArmFailure {
    #[error("no inertial sensors detected")]
    NoSensors,

    #[error("{kind} {instance}: raw rate {raw_rate_hz} Hz does not divide loop rate {loop_rate_hz} Hz")]
    RateMismatch {
        kind: SensorKind,
        instance: usize,
        raw_rate_hz: f64,
        loop_rate_hz: f64,
    },

    #[error("{kind} {instance} unhealthy")]
    Unhealthy { kind: SensorKind, instance: usize },

    #[error("accels inconsistent")]
    AccelsInconsistent,

    #[error("gyros inconsistent")]
    GyrosInconsistent,

    #[error("gyro {0} not calibrated")]
    GyroNotCalibrated(usize),

    #[error("accel {0} calibration missing or for a different sensor")]
    AccelNotCalibrated(usize),

    #[error("accels calibrated, reboot required")]
    RebootRequired,

    #[error("notch {notch} harmonic {harmonic} at {freq_hz:.1} Hz above loop-rate Nyquist")]
    NotchAboveNyquist {
        notch: usize,
        harmonic: u32,
        freq_hz: f64,
    },
}
