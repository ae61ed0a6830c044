//! Inertial sensor core: gathers accelerometer and gyroscope samples from
//! one or more backends into a calibrated, filtered stream read once per
//! control-loop cycle.
//!
//! The entry point is [`InertialSensor`]. Backends implement [`Backend`]
//! and push samples through a [`SampleSink`]; the loop calls
//! `wait_for_sample()` and `update()`, and other threads read the result
//! through a [`SnapshotHandle`].

pub mod backend;
pub mod batch;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod error;
#[cfg(feature = "fft")]
pub mod fft;
pub mod filters;
pub mod health;
pub mod ins;
pub mod instance_set;
pub mod params;
pub mod records;
pub mod registry;
pub mod rotation;
pub mod status;
pub mod sync;
pub mod types;
pub mod vibration;

pub use backend::{Backend, SampleSink, SimBackend, SimControl, SimImuConfig, ThreadedSimBackend};
pub use clock::{Clock, MonotonicClock, SimClock};
pub use config::InsConfig;
pub use error::{CalFailure, CalResult, InsError, InsResult, PreArmFailure};
pub use ins::InertialSensor;
pub use instance_set::InstanceSet;
pub use params::{JsonParamStore, MemoryParamStore, ParamStore};
pub use rotation::Rotation;
pub use status::InsStatus;
pub use sync::{Snapshot, SnapshotHandle};
pub use types::{RawSample, SensorKind, Vec3};
