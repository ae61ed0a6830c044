use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use inertial_sensor_rs::config::GyroCalTiming;
use inertial_sensor_rs::{
    CalResult, Clock, InertialSensor, InsConfig, JsonParamStore, MemoryParamStore, MonotonicClock, ParamStore,
    SimBackend, SimClock, SimControl, SimImuConfig, ThreadedSimBackend, Vec3,
};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Failure {
    /// Stop the last IMU producing samples
    Kill,
    /// Pin the last IMU's accel at full scale
    Saturate,
}

#[derive(Parser, Debug)]
#[command(name = "ins_sim")]
#[command(about = "Run the inertial sensor core against simulated IMUs", long_about = None)]
struct Args {
    /// Number of simulated IMUs
    #[arg(long, default_value_t = 2)]
    imus: usize,

    /// Raw sample rate of each IMU (Hz)
    #[arg(long, default_value_t = 1200.0)]
    raw_rate: f64,

    /// Control loop rate (Hz)
    #[arg(long, default_value_t = 400.0)]
    loop_rate: f64,

    /// Loop cycles to run
    #[arg(long, default_value_t = 4000)]
    cycles: u64,

    /// Run a gyro calibration before the main loop
    #[arg(long)]
    gyro_cal: bool,

    /// Inject a sensor failure halfway through the run
    #[arg(long, value_enum)]
    fail: Option<Failure>,

    /// Gyro bias injected into every IMU (deg/s, all axes)
    #[arg(long, default_value_t = 0.0)]
    gyro_bias_dps: f64,

    /// Sample on background threads against the wall clock
    #[arg(long)]
    realtime: bool,

    /// Configuration JSON (defaults when omitted)
    #[arg(long)]
    config: Option<String>,

    /// Parameter store JSON, created on first save
    #[arg(long)]
    params: Option<String>,

    /// Output directory
    #[arg(long, default_value = "ins_sessions")]
    output_dir: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.imus == 0 {
        bail!("at least one IMU is required");
    }

    println!("[{}] INS simulator starting", ts_now());
    println!("  IMUs: {} at {} Hz", args.imus, args.raw_rate);
    println!("  Loop: {} Hz for {} cycles", args.loop_rate, args.cycles);
    println!("  Output Dir: {}", args.output_dir);
    std::fs::create_dir_all(&args.output_dir)?;

    let config = load_config(args.config.as_deref())?;

    let params: Box<dyn ParamStore> = match &args.params {
        Some(path) => Box::new(JsonParamStore::open(path).with_context(|| format!("opening {path}"))?),
        None => Box::new(MemoryParamStore::new()),
    };
    let clock: Arc<dyn Clock> = if args.realtime {
        Arc::new(MonotonicClock::new())
    } else {
        Arc::new(SimClock::with_initial(1_000_000))
    };

    let mut ins = InertialSensor::new(config, Arc::clone(&clock), params)?;
    let mut controls: Vec<SimControl> = Vec::new();
    let bias = Vec3::repeat(args.gyro_bias_dps.to_radians());
    for i in 0..args.imus {
        let mut cfg = SimImuConfig::new(args.raw_rate, i as u64 + 1);
        cfg.gyro_bias = bias;
        let name = format!("sim{i}");
        if args.realtime {
            let backend = ThreadedSimBackend::new(&name, cfg, Arc::clone(&clock));
            controls.push(backend.control());
            ins.add_backend(Box::new(backend))?;
        } else {
            let backend = SimBackend::new(&name, cfg);
            controls.push(backend.control());
            ins.add_backend(Box::new(backend))?;
        }
    }
    ins.init(args.loop_rate)?;
    println!(
        "[{}] Detected {} accel, {} gyro",
        ts_now(),
        ins.accel_count(),
        ins.gyro_count()
    );

    if args.gyro_cal {
        println!("[{}] Calibrating gyros...", ts_now());
        match ins.calibrate_gyros() {
            CalResult::Success => println!("[{}] Gyro calibration complete", ts_now()),
            other => println!("[{}] Gyro calibration: {:?}", ts_now(), other),
        }
    }

    let fail_at = args.cycles / 2;
    let mut log_records = 0usize;
    for cycle in 0..args.cycles {
        if cycle == fail_at {
            if let (Some(failure), Some(control)) = (args.fail, controls.last()) {
                println!("[{}] Injecting {:?} on IMU {}", ts_now(), failure, controls.len() - 1);
                match failure {
                    Failure::Kill => control.kill(true),
                    Failure::Saturate => control.saturate(true),
                }
            }
        }
        ins.wait_for_sample();
        ins.update();
        if cycle % 8 == 0 {
            ins.periodic();
        }
        if ins.has_log_data() {
            log_records += ins.take_log_records().imu.len();
        }
    }
    ins.periodic();

    let status = ins.status();
    let filename = format!("{}/ins_status_{}.json", args.output_dir, ts_now_clean());
    status.save(&filename)?;

    println!("\n=== Final Stats ===");
    println!("Cycles: {}", status.cycles);
    println!("Loop delta time: {:.6} s", ins.delta_time());
    println!("First usable accel: {:?}", status.first_usable_accel);
    println!("First usable gyro: {:?}", status.first_usable_gyro);
    println!("Accels consistent: {}", status.accels_consistent);
    println!("Gyros consistent: {}", status.gyros_consistent);
    println!("IMU log records: {}", log_records);
    for inst in &status.instances {
        println!(
            "IMU {}: accel {} ({} samples), gyro {} ({} samples), vibe [{:.2}, {:.2}, {:.2}], clips {}",
            inst.instance,
            if inst.accel_healthy { "healthy" } else { "UNHEALTHY" },
            inst.accel_samples,
            if inst.gyro_healthy { "healthy" } else { "UNHEALTHY" },
            inst.gyro_samples,
            inst.vibration[0],
            inst.vibration[1],
            inst.vibration[2],
            inst.clip_total,
        );
    }
    if status.pre_arm_failures.is_empty() {
        println!("Pre-arm: OK");
    } else {
        for failure in &status.pre_arm_failures {
            println!("Pre-arm: {}", failure);
        }
    }
    println!("Status written to {}", filename);
    Ok(())
}

/// Settings from `path`, taken as written. Without a file the defaults are
/// used, minus the startup gyro calibration that `--gyro-cal` controls.
fn load_config(path: Option<&str>) -> Result<InsConfig> {
    match path {
        Some(path) => InsConfig::load_json(path).with_context(|| format!("loading {path}")),
        None => Ok(InsConfig {
            gyro_cal_timing: GyroCalTiming::Never,
            ..InsConfig::new()
        }),
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_skips_startup_gyro_cal() {
        let config = load_config(None).unwrap();
        assert_eq!(config.gyro_cal_timing, GyroCalTiming::Never);
    }

    #[test]
    fn test_config_file_timing_is_kept() {
        let path = std::env::temp_dir().join(format!("ins_sim_config_{}.json", std::process::id()));
        let written = InsConfig {
            gyro_cal_timing: GyroCalTiming::Startup,
            loop_rate_hz: 200.0,
            ..InsConfig::new()
        };
        written.save_json(&path).unwrap();
        let loaded = load_config(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.gyro_cal_timing, GyroCalTiming::Startup);
        assert_eq!(loaded.loop_rate_hz, 200.0);
    }
}
