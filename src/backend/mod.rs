//! Backend capability interface and the sample path into the core.
//!
//! A backend registers its instances while probing, then pushes samples
//! through a [`SampleSink`]. Each instance has its own bounded lock-free
//! queue with a single producer (the backend) and a single consumer (the
//! sample loop).

pub mod sim;

use crate::error::InsResult;
use crate::registry::Registrar;
use crate::types::{RawSample, SensorKind, MAX_INSTANCES};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub use sim::{SimBackend, SimControl, SimImu, SimImuConfig, ThreadedSimBackend};

pub trait Backend: Send {
    fn name(&self) -> &str;

    /// Register the instances this backend drives
    fn probe(&mut self, registrar: &mut Registrar<'_>) -> InsResult<()>;

    /// Called once after detection; samples go through `sink` from now on
    fn start(&mut self, sink: SampleSink);

    /// Produce whatever is due by `now_us`. Backends that sample from their
    /// own thread leave this empty.
    fn accumulate(&mut self, _now_us: u64) {}
}

struct InstanceQueue {
    queue: ArrayQueue<RawSample>,
    pushed: AtomicU64,
    overruns: AtomicU32,
    errors: AtomicU32,
}

impl InstanceQueue {
    fn new(depth: usize) -> Self {
        Self {
            queue: ArrayQueue::new(depth.max(1)),
            pushed: AtomicU64::new(0),
            overruns: AtomicU32::new(0),
            errors: AtomicU32::new(0),
        }
    }
}

struct SinkShared {
    accel: [InstanceQueue; MAX_INSTANCES],
    gyro: [InstanceQueue; MAX_INSTANCES],
}

/// Counters for one instance queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub overruns: u32,
    pub errors: u32,
}

#[derive(Clone)]
pub struct SampleSink {
    shared: Arc<SinkShared>,
}

impl SampleSink {
    pub fn new(depth: usize) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                accel: std::array::from_fn(|_| InstanceQueue::new(depth)),
                gyro: std::array::from_fn(|_| InstanceQueue::new(depth)),
            }),
        }
    }

    fn queue(&self, kind: SensorKind, instance: usize) -> Option<&InstanceQueue> {
        match kind {
            SensorKind::Accel => self.shared.accel.get(instance),
            SensorKind::Gyro => self.shared.gyro.get(instance),
        }
    }

    /// Queue a sample. Malformed samples are counted as errors and dropped;
    /// a full queue drops its oldest sample and counts an overrun.
    pub fn push(&self, kind: SensorKind, instance: usize, sample: RawSample) -> bool {
        let Some(q) = self.queue(kind, instance) else {
            return false;
        };
        if !sample.is_valid() {
            q.errors.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if q.queue.force_push(sample).is_some() {
            q.overruns.fetch_add(1, Ordering::Relaxed);
        }
        q.pushed.fetch_add(1, Ordering::Release);
        true
    }

    pub fn push_accel(&self, instance: usize, sample: RawSample) -> bool {
        self.push(SensorKind::Accel, instance, sample)
    }

    pub fn push_gyro(&self, instance: usize, sample: RawSample) -> bool {
        self.push(SensorKind::Gyro, instance, sample)
    }

    /// Transient fault seen by the backend (bus error, bad checksum)
    pub fn report_error(&self, kind: SensorKind, instance: usize) {
        if let Some(q) = self.queue(kind, instance) {
            q.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn pop(&self, kind: SensorKind, instance: usize) -> Option<RawSample> {
        self.queue(kind, instance).and_then(|q| q.queue.pop())
    }

    pub(crate) fn has_pending(&self, kind: SensorKind, instance: usize) -> bool {
        self.queue(kind, instance).map_or(false, |q| !q.queue.is_empty())
    }

    pub fn stats(&self, kind: SensorKind, instance: usize) -> QueueStats {
        self.queue(kind, instance)
            .map(|q| QueueStats {
                pushed: q.pushed.load(Ordering::Acquire),
                overruns: q.overruns.load(Ordering::Relaxed),
                errors: q.errors.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;

    #[test]
    fn test_push_and_pop_in_order() {
        let sink = SampleSink::new(4);
        for t in 0..3 {
            assert!(sink.push_gyro(1, RawSample::new(t, Vec3::new(t as f64, 0.0, 0.0), 25.0)));
        }
        assert!(sink.has_pending(SensorKind::Gyro, 1));
        assert!(!sink.has_pending(SensorKind::Gyro, 0));
        let times: Vec<u64> = std::iter::from_fn(|| sink.pop(SensorKind::Gyro, 1))
            .map(|s| s.timestamp_us)
            .collect();
        assert_eq!(times, vec![0, 1, 2]);
    }

    #[test]
    fn test_overrun_drops_oldest() {
        let sink = SampleSink::new(2);
        for t in 0..5 {
            sink.push_accel(0, RawSample::new(t, Vec3::zeros(), 25.0));
        }
        let stats = sink.stats(SensorKind::Accel, 0);
        assert_eq!(stats.pushed, 5);
        assert_eq!(stats.overruns, 3);
        assert_eq!(sink.pop(SensorKind::Accel, 0).map(|s| s.timestamp_us), Some(3));
    }

    #[test]
    fn test_malformed_sample_counts_error() {
        let sink = SampleSink::new(4);
        assert!(!sink.push_accel(0, RawSample::new(0, Vec3::new(f64::NAN, 0.0, 0.0), 25.0)));
        sink.report_error(SensorKind::Accel, 0);
        assert_eq!(sink.stats(SensorKind::Accel, 0).errors, 2);
        assert!(!sink.has_pending(SensorKind::Accel, 0));
        assert!(!sink.push_accel(MAX_INSTANCES, RawSample::new(0, Vec3::zeros(), 25.0)));
    }
}
