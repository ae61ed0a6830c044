//! Log taps. The wire format belongs to whoever consumes these; the core
//! only builds serializable records from the latest snapshot.

use crate::sync::Snapshot;
use crate::types::{to_array, Vec3};
use serde::Serialize;

/// Per-instance IMU sample record
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImuRecord {
    pub timestamp_us: u64,
    pub instance: usize,
    pub gyro: [f64; 3],
    pub accel: [f64; 3],
    pub gyro_errors: u32,
    pub accel_errors: u32,
    pub temperature: f64,
    pub gyro_healthy: bool,
    pub accel_healthy: bool,
    pub gyro_samples: u64,
    pub accel_samples: u64,
}

impl ImuRecord {
    pub fn from_snapshot(snap: &Snapshot, instance: usize, accel_errors: u32, gyro_errors: u32) -> Self {
        Self {
            timestamp_us: snap.timestamp_us,
            instance,
            gyro: to_array(&snap.gyro[instance]),
            accel: to_array(&snap.accel[instance]),
            gyro_errors,
            accel_errors,
            temperature: snap.accel_temperature[instance],
            gyro_healthy: snap.gyro_healthy.contains(instance),
            accel_healthy: snap.accel_healthy.contains(instance),
            gyro_samples: snap.gyro_sample_count[instance],
            accel_samples: snap.accel_sample_count[instance],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VibeRecord {
    pub timestamp_us: u64,
    pub instance: usize,
    pub vibe: [f64; 3],
    pub clip_total: u64,
}

impl VibeRecord {
    pub fn new(timestamp_us: u64, instance: usize, vibe: &Vec3, clip_total: u64) -> Self {
        Self {
            timestamp_us,
            instance,
            vibe: to_array(vibe),
            clip_total,
        }
    }
}

/// Records collected since the last fetch
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LogRecords {
    pub imu: Vec<ImuRecord>,
    pub vibe: Vec<VibeRecord>,
}

impl LogRecords {
    pub fn is_empty(&self) -> bool {
        self.imu.is_empty() && self.vibe.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_set::InstanceSet;

    #[test]
    fn test_imu_record_from_snapshot() {
        let mut snap = Snapshot::new();
        snap.timestamp_us = 42;
        snap.accel[1] = Vec3::new(0.0, 0.0, -9.8);
        snap.gyro[1] = Vec3::new(0.01, 0.0, 0.0);
        snap.accel_healthy = InstanceSet::from_ids(&[1]);
        snap.accel_sample_count[1] = 10;
        let rec = ImuRecord::from_snapshot(&snap, 1, 2, 0);
        assert_eq!(rec.accel, [0.0, 0.0, -9.8]);
        assert!(rec.accel_healthy);
        assert!(!rec.gyro_healthy);
        assert_eq!(rec.accel_errors, 2);
        assert_eq!(rec.accel_samples, 10);

        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"instance\":1"));
    }
}
