//! High-rate batch sampler.
//!
//! Captures a contiguous run of raw samples from one sensor at a time into a
//! buffer allocated at startup. `update()` only copies into the buffer;
//! `periodic()` slices it into chunks, hands them to a channel and then moves
//! on to the next sensor.

use crate::instance_set::InstanceSet;
use crate::types::{SensorKind, Vec3, MAX_INSTANCES};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Samples captured per batch
    pub sample_count: usize,
    pub samples_per_chunk: usize,
    pub push_interval_ms: u64,
    pub accel: bool,
    pub gyro: bool,
    /// Bit n includes instance n
    pub instance_mask: u8,
    /// Capture filtered rather than raw samples
    pub post_filter: bool,
    /// Chunks buffered for the consumer before new ones are dropped
    pub channel_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_count: 1024,
            samples_per_chunk: 32,
            push_interval_ms: 20,
            accel: true,
            gyro: true,
            instance_mask: 0b111,
            post_filter: false,
            channel_capacity: 64,
        }
    }
}

/// One slice of a completed batch
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchChunk {
    pub kind: SensorKind,
    pub instance: usize,
    pub batch: u32,
    pub sequence: u32,
    /// Timestamp of the first sample in the batch
    pub batch_start_us: u64,
    pub sample_rate_hz: f64,
    pub post_filter: bool,
    pub samples: Vec<[f64; 3]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Filling,
    Draining,
}

pub struct BatchSampler {
    cfg: BatchConfig,
    targets: Vec<(SensorKind, usize)>,
    rates: [[f64; MAX_INSTANCES]; 2],
    target: usize,
    buffer: Vec<[f64; 3]>,
    batch_len: usize,
    batch_start_us: u64,
    phase: Phase,
    read_pos: usize,
    batch: u32,
    sequence: u32,
    last_push_ms: u64,
    dropped_chunks: u32,
    tx: Sender<BatchChunk>,
    rx: Receiver<BatchChunk>,
}

fn kind_index(kind: SensorKind) -> usize {
    match kind {
        SensorKind::Accel => 0,
        SensorKind::Gyro => 1,
    }
}

impl BatchSampler {
    pub fn new(cfg: &BatchConfig) -> Self {
        let (tx, rx) = channel::bounded(cfg.channel_capacity.max(1));
        let capacity = if cfg.enabled { cfg.sample_count.max(1) } else { 0 };
        Self {
            cfg: cfg.clone(),
            targets: Vec::new(),
            rates: [[0.0; MAX_INSTANCES]; 2],
            target: 0,
            buffer: Vec::with_capacity(capacity),
            batch_len: capacity,
            batch_start_us: 0,
            phase: Phase::Filling,
            read_pos: 0,
            batch: 0,
            sequence: 0,
            last_push_ms: 0,
            dropped_chunks: 0,
            tx,
            rx,
        }
    }

    /// Choose the sensors to rotate through once instances are known
    pub fn set_sensors(&mut self, accels: &[(usize, f64)], gyros: &[(usize, f64)]) {
        self.targets.clear();
        let mask = InstanceSet::from_bits(self.cfg.instance_mask);
        for (enabled, kind, list) in [
            (self.cfg.accel, SensorKind::Accel, accels),
            (self.cfg.gyro, SensorKind::Gyro, gyros),
        ] {
            for &(instance, rate) in list {
                if instance < MAX_INSTANCES {
                    self.rates[kind_index(kind)][instance] = rate;
                }
                if enabled && mask.contains(instance) {
                    self.targets.push((kind, instance));
                }
            }
        }
        self.target = 0;
        self.reset_batch();
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled && !self.targets.is_empty()
    }

    pub fn post_filter(&self) -> bool {
        self.cfg.post_filter
    }

    pub fn current_target(&self) -> Option<(SensorKind, usize)> {
        self.targets.get(self.target).copied()
    }

    /// True while samples for this sensor are being captured
    pub fn wants(&self, kind: SensorKind, instance: usize) -> bool {
        self.is_enabled() && self.phase == Phase::Filling && self.current_target() == Some((kind, instance))
    }

    /// Called from the sample loop; never allocates
    pub fn push(&mut self, kind: SensorKind, instance: usize, timestamp_us: u64, value: &Vec3) {
        if !self.wants(kind, instance) {
            return;
        }
        if self.buffer.is_empty() {
            self.batch_start_us = timestamp_us;
        }
        self.buffer.push([value.x, value.y, value.z]);
        if self.buffer.len() >= self.batch_len {
            self.phase = Phase::Draining;
        }
    }

    /// Send at most one chunk per push interval; advance to the next sensor
    /// once a batch is fully sent
    pub fn periodic(&mut self, now_ms: u64) {
        if !self.is_enabled() || self.phase != Phase::Draining {
            return;
        }
        if now_ms.saturating_sub(self.last_push_ms) < self.cfg.push_interval_ms {
            return;
        }
        let Some((kind, instance)) = self.current_target() else {
            return;
        };
        let end = (self.read_pos + self.cfg.samples_per_chunk.max(1)).min(self.buffer.len());
        let chunk = BatchChunk {
            kind,
            instance,
            batch: self.batch,
            sequence: self.sequence,
            batch_start_us: self.batch_start_us,
            sample_rate_hz: self.rates[kind_index(kind)][instance],
            post_filter: self.cfg.post_filter,
            samples: self.buffer[self.read_pos..end].to_vec(),
        };
        match self.tx.try_send(chunk) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped_chunks += 1;
            }
        }
        self.last_push_ms = now_ms;
        self.read_pos = end;
        self.sequence += 1;
        if self.read_pos >= self.buffer.len() {
            log::debug!("batch {} of {} {} sent", self.batch, kind, instance);
            self.batch += 1;
            self.target = (self.target + 1) % self.targets.len();
            self.reset_batch();
        }
    }

    fn reset_batch(&mut self) {
        self.buffer.clear();
        self.phase = Phase::Filling;
        self.read_pos = 0;
        self.sequence = 0;
    }

    pub fn receiver(&self) -> Receiver<BatchChunk> {
        self.rx.clone()
    }

    pub fn dropped_chunks(&self) -> u32 {
        self.dropped_chunks
    }

    pub fn batches_sent(&self) -> u32 {
        self.batch
    }
}
