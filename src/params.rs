//! Key/value persistence for calibration and filter settings.
//!
//! Values are only written back by an explicit [`ParamStore::save`]; the
//! sensor core calls it after an accepted calibration or a forced save.

use crate::error::InsResult;
use crate::types::{Vec3, AXES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub trait ParamStore: Send {
    fn get(&self, key: &str) -> Option<f64>;
    fn set(&mut self, key: &str, value: f64);
    /// Persist everything set so far
    fn save(&mut self) -> InsResult<()>;

    fn get_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).unwrap_or(default)
    }

    /// Read the `_X/_Y/_Z` triple behind `prefix`, if all three exist
    fn get_vec3(&self, prefix: &str) -> Option<Vec3> {
        let x = self.get(&format!("{prefix}_{}", AXES[0]))?;
        let y = self.get(&format!("{prefix}_{}", AXES[1]))?;
        let z = self.get(&format!("{prefix}_{}", AXES[2]))?;
        Some(Vec3::new(x, y, z))
    }

    fn set_vec3(&mut self, prefix: &str, v: &Vec3) {
        for (axis, value) in AXES.iter().zip(v.iter()) {
            self.set(&format!("{prefix}_{axis}"), *value);
        }
    }
}

/// In-memory store, counts saves so callers can check persistence points
#[derive(Clone, Debug, Default)]
pub struct MemoryParamStore {
    values: BTreeMap<String, f64>,
    save_count: u32,
}

impl MemoryParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> u32 {
        self.save_count
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }
}

impl ParamStore for MemoryParamStore {
    fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    fn set(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    fn save(&mut self) -> InsResult<()> {
        self.save_count += 1;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct ParamFile {
    params: BTreeMap<String, f64>,
}

/// JSON file-backed store
#[derive(Debug)]
pub struct JsonParamStore {
    path: PathBuf,
    values: BTreeMap<String, f64>,
}

impl JsonParamStore {
    /// Open `path`, starting empty when the file does not exist yet
    pub fn open<P: AsRef<Path>>(path: P) -> InsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let text = fs::read_to_string(&path)?;
            let file: ParamFile = serde_json::from_str(&text)?;
            file.params
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ParamStore for JsonParamStore {
    fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    fn set(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    fn save(&mut self) -> InsResult<()> {
        let file = ParamFile {
            params: self.values.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, json)?;
        log::debug!("saved {} parameters to {}", self.values.len(), self.path.display());
        Ok(())
    }
}

// ===== Key naming =====
//
// Instance 0 carries no number (INS_ACCOFFS), later ones do (INS_ACC2OFFS).

fn numbered(base: &str, instance: usize, rest: &str) -> String {
    if instance == 0 {
        format!("INS_{base}{rest}")
    } else {
        format!("INS_{base}{}{rest}", instance + 1)
    }
}

pub fn accel_offset_prefix(instance: usize) -> String {
    numbered("ACC", instance, "OFFS")
}

pub fn accel_scale_prefix(instance: usize) -> String {
    numbered("ACC", instance, "SCAL")
}

pub fn gyro_offset_prefix(instance: usize) -> String {
    numbered("GYR", instance, "OFFS")
}

pub fn accel_id_key(instance: usize) -> String {
    numbered("ACC", instance, "_ID")
}

pub fn gyro_id_key(instance: usize) -> String {
    numbered("GYR", instance, "_ID")
}

pub fn position_prefix(instance: usize) -> String {
    format!("INS_POS{}", instance + 1)
}

pub fn accel_cal_temp_key(instance: usize) -> String {
    format!("INS_ACC{}_CALTEMP", instance + 1)
}

pub fn gyro_cal_temp_key(instance: usize) -> String {
    format!("INS_GYR{}_CALTEMP", instance + 1)
}

pub fn tcal_prefix(instance: usize) -> String {
    format!("INS_TCAL{}", instance + 1)
}

pub const TRIM_X: &str = "AHRS_TRIM_X";
pub const TRIM_Y: &str = "AHRS_TRIM_Y";
pub const GYRO_FILTER: &str = "INS_GYRO_FILTER";
pub const ACCEL_FILTER: &str = "INS_ACCEL_FILTER";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_follow_instance_numbering() {
        assert_eq!(accel_offset_prefix(0), "INS_ACCOFFS");
        assert_eq!(accel_scale_prefix(1), "INS_ACC2SCAL");
        assert_eq!(gyro_offset_prefix(2), "INS_GYR3OFFS");
        assert_eq!(accel_id_key(0), "INS_ACC_ID");
        assert_eq!(gyro_id_key(1), "INS_GYR2_ID");
        assert_eq!(position_prefix(0), "INS_POS1");
        assert_eq!(accel_cal_temp_key(0), "INS_ACC1_CALTEMP");
    }

    #[test]
    fn test_vec3_round_trip_in_memory() {
        let mut store = MemoryParamStore::new();
        assert!(store.get_vec3("INS_ACCOFFS").is_none());
        store.set_vec3("INS_ACCOFFS", &Vec3::new(0.1, -0.2, 0.3));
        assert_eq!(store.get("INS_ACCOFFS_Y"), Some(-0.2));
        assert_eq!(store.get_vec3("INS_ACCOFFS"), Some(Vec3::new(0.1, -0.2, 0.3)));
        assert_eq!(store.save_count(), 0);
        store.save().unwrap();
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_json_store_persists_across_open() {
        let path = std::env::temp_dir().join(format!("ins_params_{}.json", std::process::id()));
        let _ = fs::remove_file(&path);

        let mut store = JsonParamStore::open(&path).unwrap();
        store.set("INS_ACC_ID", 1234.0);
        store.set_vec3("INS_GYROFFS", &Vec3::new(0.01, 0.02, 0.03));
        store.save().unwrap();

        let reopened = JsonParamStore::open(&path).unwrap();
        assert_eq!(reopened.get("INS_ACC_ID"), Some(1234.0));
        assert_eq!(reopened.get_vec3("INS_GYROFFS"), Some(Vec3::new(0.01, 0.02, 0.03)));

        let _ = fs::remove_file(&path);
    }
}
