use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Health and counters for one accel/gyro instance pair
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct InstanceStatus {
    pub instance: usize,
    pub accel_present: bool,
    pub gyro_present: bool,
    pub accel_healthy: bool,
    pub gyro_healthy: bool,
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub accel_errors: u32,
    pub gyro_errors: u32,
    pub accel_rate_hz: f64,
    pub gyro_rate_hz: f64,
    pub vibration: [f64; 3],
    pub clip_total: u64,
    pub accel_cal_ok: bool,
    pub gyro_cal_ok: bool,
    pub accel_offset: [f64; 3],
    pub accel_scale: [f64; 3],
    pub gyro_offset: [f64; 3],
    pub temperature: f64,
}

/// Snapshot of the inertial core written as a JSON status file
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InsStatus {
    pub timestamp: f64,
    pub loop_rate_hz: f64,
    pub cycles: u64,
    pub accel_count: usize,
    pub gyro_count: usize,
    pub first_usable_accel: Option<usize>,
    pub first_usable_gyro: Option<usize>,
    pub accels_consistent: bool,
    pub gyros_consistent: bool,
    pub is_still: bool,
    pub accel_peak_hold_neg_x: f64,
    pub calibrating: bool,
    pub reboot_required: bool,
    pub trim: [f64; 3],
    pub pre_arm_failures: Vec<String>,
    pub instances: Vec<InstanceStatus>,
}

impl InsStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            loop_rate_hz: 0.0,
            cycles: 0,
            accel_count: 0,
            gyro_count: 0,
            first_usable_accel: None,
            first_usable_gyro: None,
            accels_consistent: true,
            gyros_consistent: true,
            is_still: false,
            accel_peak_hold_neg_x: 0.0,
            calibrating: false,
            reboot_required: false,
            trim: [0.0; 3],
            pre_arm_failures: Vec::new(),
            instances: Vec::new(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for InsStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_writes_pretty_json() {
        let mut status = InsStatus::new();
        status.cycles = 12;
        status.instances.push(InstanceStatus {
            instance: 0,
            accel_present: true,
            ..InstanceStatus::default()
        });
        let path = std::env::temp_dir().join(format!("ins_status_{}.json", std::process::id()));
        status.save(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let loaded: InsStatus = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded, status);
        assert!(text.contains("\n  \"cycles\": 12"));
        let _ = fs::remove_file(&path);
    }
}
