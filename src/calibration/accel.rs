//! Multi-position accelerometer calibration.
//!
//! The corrected reading is `M * (raw - offset)` with `M` symmetric: the
//! diagonal holds the scale factors and the off-diagonal terms the cross-axis
//! coupling. Gauss-Newton minimises the squared difference between each
//! corrected sample's magnitude and local gravity.

use super::AccelCalibration;
use crate::config::AccelCalConfig;
use crate::error::CalFailure;
use crate::types::{
    FitJacobian, FitParams, FitResiduals, Mat3, Vec3, ELLIPSOID_PARAMS, GRAVITY_MSS, SPHERE_PARAMS,
};
use serde::{Deserialize, Serialize};

const MAX_STEP_HALVINGS: usize = 8;
const CONVERGED_IMPROVEMENT: f64 = 1e-12;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitModel {
    /// Offset and per-axis scale
    #[default]
    Sphere,
    /// Offset, scale and cross-axis terms
    Ellipsoid,
}

impl FitModel {
    pub fn param_count(&self) -> usize {
        match self {
            FitModel::Sphere => SPHERE_PARAMS,
            FitModel::Ellipsoid => ELLIPSOID_PARAMS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccelCalParams {
    pub offset: Vec3,
    pub diag: Vec3,
    /// (xy, xz, yz)
    pub offdiag: Vec3,
}

impl AccelCalParams {
    pub fn identity() -> Self {
        Self {
            offset: Vec3::zeros(),
            diag: Vec3::new(1.0, 1.0, 1.0),
            offdiag: Vec3::zeros(),
        }
    }

    pub fn matrix(&self) -> Mat3 {
        let (d, o) = (&self.diag, &self.offdiag);
        Mat3::new(d.x, o.x, o.y, o.x, d.y, o.z, o.y, o.z, d.z)
    }

    pub fn correct(&self, raw: &Vec3) -> Vec3 {
        self.matrix() * (raw - self.offset)
    }

    fn to_vector(&self, model: FitModel) -> FitParams {
        let mut p = FitParams::zeros(model.param_count());
        for i in 0..3 {
            p[i] = self.offset[i];
            p[3 + i] = self.diag[i];
        }
        if model == FitModel::Ellipsoid {
            for i in 0..3 {
                p[6 + i] = self.offdiag[i];
            }
        }
        p
    }

    fn from_vector(p: &FitParams) -> Self {
        let mut params = Self::identity();
        for i in 0..3 {
            params.offset[i] = p[i];
            params.diag[i] = p[3 + i];
        }
        if p.len() == ELLIPSOID_PARAMS {
            for i in 0..3 {
                params.offdiag[i] = p[6 + i];
            }
        }
        params
    }
}

impl Default for AccelCalParams {
    fn default() -> Self {
        Self::identity()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    pub params: AccelCalParams,
    /// RMS of |corrected| - g over all samples, m/s²
    pub fitness: f64,
    pub iterations: usize,
}

/// RMS gravity-magnitude residual of `samples` under `params`
pub fn fitness(samples: &[Vec3], params: &AccelCalParams) -> f64 {
    if samples.is_empty() {
        return f64::INFINITY;
    }
    let sum: f64 = samples
        .iter()
        .map(|s| {
            let r = GRAVITY_MSS - params.correct(s).norm();
            r * r
        })
        .sum();
    (sum / samples.len() as f64).sqrt()
}

fn jacobian_and_residuals(samples: &[Vec3], params: &AccelCalParams, model: FitModel) -> (FitJacobian, FitResiduals) {
    let k = model.param_count();
    let mut jac = FitJacobian::zeros(samples.len(), k);
    let mut res = FitResiduals::zeros(samples.len());
    let m = params.matrix();
    for (i, sample) in samples.iter().enumerate() {
        let v = sample - params.offset;
        let c = m * v;
        let n = c.norm().max(f64::EPSILON);
        res[i] = GRAVITY_MSS - n;

        let d_offset = (m * c) / n;
        for j in 0..3 {
            jac[(i, j)] = d_offset[j];
            jac[(i, 3 + j)] = -c[j] * v[j] / n;
        }
        if model == FitModel::Ellipsoid {
            jac[(i, 6)] = -(c.x * v.y + c.y * v.x) / n;
            jac[(i, 7)] = -(c.x * v.z + c.z * v.x) / n;
            jac[(i, 8)] = -(c.y * v.z + c.z * v.y) / n;
        }
    }
    (jac, res)
}

/// Gauss-Newton fit starting from `initial`, with step halving when a full
/// step would make the fit worse
pub fn fit(
    samples: &[Vec3],
    model: FitModel,
    initial: &AccelCalParams,
    max_iterations: usize,
) -> Result<FitOutcome, CalFailure> {
    let need = model.param_count();
    if samples.len() < need {
        return Err(CalFailure::NotEnoughSamples {
            have: samples.len(),
            need,
        });
    }

    let mut p = initial.to_vector(model);
    let mut best = fitness(samples, &AccelCalParams::from_vector(&p));
    let mut iterations = 0;

    for _ in 0..max_iterations {
        iterations += 1;
        let (jac, res) = jacobian_and_residuals(samples, &AccelCalParams::from_vector(&p), model);
        let jt = jac.transpose();
        let Some(inv) = (&jt * &jac).try_inverse() else {
            return Err(CalFailure::Singular);
        };
        let step = inv * (&jt * &res);

        let mut scale = 1.0;
        let mut improvement = None;
        for _ in 0..MAX_STEP_HALVINGS {
            let candidate = &p - &step * scale;
            let f = fitness(samples, &AccelCalParams::from_vector(&candidate));
            if f.is_finite() && f <= best {
                improvement = Some(best - f);
                best = f;
                p = candidate;
                break;
            }
            scale *= 0.5;
        }
        match improvement {
            Some(delta) if delta > CONVERGED_IMPROVEMENT => continue,
            _ => break,
        }
    }

    if !best.is_finite() {
        return Err(CalFailure::Divergent);
    }
    Ok(FitOutcome {
        params: AccelCalParams::from_vector(&p),
        fitness: best,
        iterations,
    })
}

/// Reject fits that are poor or physically implausible
pub fn check_fit(outcome: &FitOutcome, cfg: &AccelCalConfig, max_abs_offset: f64) -> Result<(), CalFailure> {
    if outcome.fitness > cfg.fitness_tolerance_mss {
        return Err(CalFailure::PoorFit(outcome.fitness));
    }
    let p = &outcome.params;
    if let Some(s) = p.diag.iter().find(|s| !(cfg.scale_min..=cfg.scale_max).contains(*s)) {
        return Err(CalFailure::ScaleOutOfRange(*s));
    }
    if let Some(o) = p.offdiag.iter().find(|o| o.abs() > cfg.offdiag_limit) {
        return Err(CalFailure::CrossAxisOutOfRange(*o));
    }
    if let Some(o) = p.offset.iter().find(|o| o.abs() > max_abs_offset) {
        return Err(CalFailure::OffsetOutOfRange(*o));
    }
    Ok(())
}

/// Bound how far a new offset may move from the one in use
pub fn check_offset_change(new_offset: &Vec3, prior: &AccelCalibration, max_change: f64) -> Result<(), CalFailure> {
    for axis in 0..3 {
        let change = (new_offset[axis] - prior.offset[axis]).abs();
        if change > max_change {
            return Err(CalFailure::OffsetChangeExceeded { axis, change });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccelCalStatus {
    NotStarted,
    WaitingForOrientation,
    CollectingSample,
    ReadyToFit,
    Success,
    Failed,
}

/// Per-instance collector and solver
#[derive(Clone, Debug)]
pub struct AccelCalibrator {
    model: FitModel,
    positions: usize,
    collect_time_s: f64,
    min_separation_rad: f64,
    status: AccelCalStatus,
    samples: Vec<Vec3>,
    dv_sum: Vec3,
    dt_sum: f64,
    outcome: Option<FitOutcome>,
    failure: Option<CalFailure>,
}

impl AccelCalibrator {
    pub fn new(cfg: &AccelCalConfig) -> Self {
        let positions = cfg.positions.max(cfg.model.param_count());
        Self {
            model: cfg.model,
            positions,
            collect_time_s: cfg.collect_time_s,
            min_separation_rad: cfg.min_separation_deg.to_radians(),
            status: AccelCalStatus::NotStarted,
            samples: Vec::with_capacity(positions),
            dv_sum: Vec3::zeros(),
            dt_sum: 0.0,
            outcome: None,
            failure: None,
        }
    }

    pub fn start(&mut self) {
        self.samples.clear();
        self.dv_sum = Vec3::zeros();
        self.dt_sum = 0.0;
        self.outcome = None;
        self.failure = None;
        self.status = AccelCalStatus::WaitingForOrientation;
    }

    pub fn status(&self) -> AccelCalStatus {
        self.status
    }

    pub fn failure(&self) -> Option<CalFailure> {
        self.failure
    }

    pub fn outcome(&self) -> Option<&FitOutcome> {
        self.outcome.as_ref()
    }

    pub fn samples(&self) -> &[Vec3] {
        &self.samples
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    /// Operator has placed the vehicle; start averaging
    pub fn begin_sample(&mut self) -> bool {
        if self.status != AccelCalStatus::WaitingForOrientation {
            return false;
        }
        self.dv_sum = Vec3::zeros();
        self.dt_sum = 0.0;
        self.status = AccelCalStatus::CollectingSample;
        true
    }

    /// Feed uncalibrated delta-velocity gathered over `dt` seconds
    pub fn add_delta_velocity(&mut self, dv: &Vec3, dt: f64) {
        if self.status != AccelCalStatus::CollectingSample || dt <= 0.0 {
            return;
        }
        self.dv_sum += dv;
        self.dt_sum += dt;
        if self.dt_sum >= self.collect_time_s {
            let sample = self.dv_sum / self.dt_sum;
            self.finish_sample(sample);
        }
    }

    fn finish_sample(&mut self, sample: Vec3) {
        let too_close = self
            .samples
            .iter()
            .any(|s| s.angle(&sample) < self.min_separation_rad);
        if too_close {
            self.fail(CalFailure::SampleTooClose);
            return;
        }
        self.samples.push(sample);
        self.status = if self.samples.len() >= self.positions {
            AccelCalStatus::ReadyToFit
        } else {
            AccelCalStatus::WaitingForOrientation
        };
    }

    /// Solve and validate against the calibration currently in use
    pub fn run_fit(&mut self, cfg: &AccelCalConfig, prior: &AccelCalibration, max_abs_offset: f64) {
        if self.status != AccelCalStatus::ReadyToFit {
            return;
        }
        let result = fit(&self.samples, self.model, &AccelCalParams::identity(), cfg.max_iterations)
            .and_then(|outcome| {
                check_fit(&outcome, cfg, max_abs_offset)?;
                check_offset_change(&outcome.params.offset, prior, cfg.max_offset_change_mss)?;
                Ok(outcome)
            });
        match result {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                self.status = AccelCalStatus::Success;
            }
            Err(failure) => self.fail(failure),
        }
    }

    pub fn fail(&mut self, failure: CalFailure) {
        self.failure = Some(failure);
        self.status = AccelCalStatus::Failed;
    }

    /// Collected sample `index` under the fitted calibration
    pub fn corrected_sample(&self, index: usize) -> Option<Vec3> {
        let outcome = self.outcome.as_ref()?;
        self.samples.get(index).map(|s| outcome.params.correct(s))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Raw readings a sensor with `truth` would report for gravity along `dirs`
    pub(crate) fn synthetic_samples(truth: &AccelCalParams, dirs: &[Vec3]) -> Vec<Vec3> {
        let inv = truth.matrix().try_inverse().unwrap();
        dirs.iter()
            .map(|d| inv * (d.normalize() * GRAVITY_MSS) + truth.offset)
            .collect()
    }

    pub(crate) fn six_positions() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
        ]
    }

    fn twelve_positions() -> Vec<Vec3> {
        let mut dirs = six_positions();
        dirs.extend([
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 1.0, -1.0),
            Vec3::new(-1.0, 1.0, 1.0),
            Vec3::new(1.0, -1.0, -1.0),
            Vec3::new(-1.0, -1.0, 0.5),
        ]);
        dirs
    }

    #[test]
    fn test_sphere_fit_recovers_offset_and_scale() {
        let truth = AccelCalParams {
            offset: Vec3::new(0.3, -0.2, 0.5),
            diag: Vec3::new(1.02, 0.97, 1.01),
            offdiag: Vec3::zeros(),
        };
        let samples = synthetic_samples(&truth, &six_positions());
        let outcome = fit(&samples, FitModel::Sphere, &AccelCalParams::identity(), 50).unwrap();
        assert_abs_diff_eq!(outcome.params.offset, truth.offset, epsilon = 1e-6);
        assert_abs_diff_eq!(outcome.params.diag, truth.diag, epsilon = 1e-6);
        assert!(outcome.fitness < 1e-6);
    }

    #[test]
    fn test_fit_is_idempotent_on_calibrated_input() {
        let truth = AccelCalParams {
            offset: Vec3::new(-0.4, 0.1, 0.25),
            diag: Vec3::new(0.98, 1.03, 1.0),
            offdiag: Vec3::new(0.01, -0.02, 0.015),
        };
        let samples = synthetic_samples(&truth, &twelve_positions());
        let first = fit(&samples, FitModel::Ellipsoid, &AccelCalParams::identity(), 50).unwrap();
        let second = fit(&samples, FitModel::Ellipsoid, &first.params, 50).unwrap();
        assert_abs_diff_eq!(first.params.offset, truth.offset, epsilon = 1e-6);
        assert_abs_diff_eq!(first.params.offdiag, truth.offdiag, epsilon = 1e-6);
        assert_abs_diff_eq!(second.params.offset, first.params.offset, epsilon = 1e-9);
        assert_abs_diff_eq!(second.params.diag, first.params.diag, epsilon = 1e-9);
    }

    #[test]
    fn test_too_few_samples_rejected() {
        let samples = synthetic_samples(&AccelCalParams::identity(), &six_positions()[..4]);
        let err = fit(&samples, FitModel::Sphere, &AccelCalParams::identity(), 50).unwrap_err();
        assert_eq!(err, CalFailure::NotEnoughSamples { have: 4, need: 6 });
    }

    #[test]
    fn test_check_fit_limits() {
        let cfg = AccelCalConfig::default();
        let mut outcome = FitOutcome {
            params: AccelCalParams::identity(),
            fitness: 0.01,
            iterations: 3,
        };
        assert!(check_fit(&outcome, &cfg, 3.5).is_ok());

        outcome.params.diag.y = 1.3;
        assert_eq!(check_fit(&outcome, &cfg, 3.5), Err(CalFailure::ScaleOutOfRange(1.3)));

        outcome.params.diag.y = 1.0;
        outcome.params.offset.z = 4.0;
        assert_eq!(check_fit(&outcome, &cfg, 3.5), Err(CalFailure::OffsetOutOfRange(4.0)));

        outcome.params.offset.z = 0.0;
        outcome.fitness = 2.0;
        assert_eq!(check_fit(&outcome, &cfg, 3.5), Err(CalFailure::PoorFit(2.0)));
    }

    #[test]
    fn test_offset_change_bound() {
        let prior = AccelCalibration::default();
        assert!(check_offset_change(&Vec3::new(0.5, 0.0, 0.0), &prior, 1.0).is_ok());
        assert!(matches!(
            check_offset_change(&Vec3::new(0.0, -1.5, 0.0), &prior, 1.0),
            Err(CalFailure::OffsetChangeExceeded { axis: 1, .. })
        ));
    }

    #[test]
    fn test_calibrator_collects_and_fits() {
        let cfg = AccelCalConfig::default();
        let truth = AccelCalParams {
            offset: Vec3::new(0.2, 0.1, -0.3),
            diag: Vec3::new(1.01, 0.99, 1.02),
            offdiag: Vec3::zeros(),
        };
        let mut cal = AccelCalibrator::new(&cfg);
        cal.start();
        for raw in synthetic_samples(&truth, &six_positions()) {
            assert!(cal.begin_sample());
            // 0.5 s collection delivered in 2.5 ms chunks, one spare
            for _ in 0..201 {
                cal.add_delta_velocity(&(raw * 0.0025), 0.0025);
            }
        }
        assert_eq!(cal.status(), AccelCalStatus::ReadyToFit);
        cal.run_fit(&cfg, &AccelCalibration::default(), 3.5);
        assert_eq!(cal.status(), AccelCalStatus::Success);
        let level = cal.corrected_sample(0).unwrap();
        assert_abs_diff_eq!(level, Vec3::new(0.0, 0.0, -GRAVITY_MSS), epsilon = 1e-6);
    }

    #[test]
    fn test_repeated_orientation_fails() {
        let cfg = AccelCalConfig::default();
        let mut cal = AccelCalibrator::new(&cfg);
        cal.start();
        let level = Vec3::new(0.0, 0.0, -GRAVITY_MSS);
        for _ in 0..2 {
            cal.begin_sample();
            cal.add_delta_velocity(&(level * 0.6), 0.6);
        }
        assert_eq!(cal.status(), AccelCalStatus::Failed);
        assert_eq!(cal.failure(), Some(CalFailure::SampleTooClose));
    }
}
