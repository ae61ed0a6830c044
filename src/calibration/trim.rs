use crate::error::CalFailure;
use crate::types::Vec3;

/// Largest roll or pitch trim accepted
pub const TRIM_LIMIT_DEG: f64 = 10.0;

/// Roll (x) and pitch (y) trim, in radians, from a body-frame gravity sample
pub fn calculate_trim(accel: &Vec3) -> Result<Vec3, CalFailure> {
    let pitch = accel.x.atan2(accel.y.hypot(accel.z));
    let roll = (-accel.y).atan2(-accel.z);
    let limit = TRIM_LIMIT_DEG.to_radians();
    if roll.abs() > limit {
        return Err(CalFailure::TrimOutOfRange(roll.to_degrees()));
    }
    if pitch.abs() > limit {
        return Err(CalFailure::TrimOutOfRange(pitch.to_degrees()));
    }
    Ok(Vec3::new(roll, pitch, 0.0))
}
