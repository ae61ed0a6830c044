//! Per-instance health tracking and cross-instance consistency.
//!
//! Everything here runs inside `update()`, so it works on fixed-size state
//! and never allocates after construction.

use crate::config::HealthConfig;
use crate::instance_set::InstanceSet;
use crate::types::{Vec3, MAX_INSTANCES};

/// Health of one accel or gyro instance
#[derive(Clone, Debug)]
pub struct InstanceHealth {
    missed_limit: u32,
    error_threshold: u32,
    missed_cycles: u32,
    /// Errors per cycle over the rolling window
    window: Vec<u32>,
    window_pos: usize,
    window_sum: u32,
    last_error_total: u32,
    startup_errors: u32,
    errors_since_startup: u32,
    healthy: bool,
}

impl InstanceHealth {
    pub fn new(cfg: &HealthConfig) -> Self {
        Self {
            missed_limit: cfg.missed_cycle_limit.max(1),
            error_threshold: cfg.error_threshold.max(1),
            missed_cycles: 0,
            window: vec![0; cfg.error_window_cycles.max(1)],
            window_pos: 0,
            window_sum: 0,
            last_error_total: 0,
            startup_errors: 0,
            errors_since_startup: 0,
            healthy: true,
        }
    }

    /// Account one loop cycle. `error_total` is the backend's cumulative
    /// error count for this instance. Returns the new health on a transition.
    pub fn record_cycle(&mut self, delivered: bool, error_total: u32, in_startup_grace: bool) -> Option<bool> {
        let new_errors = error_total.wrapping_sub(self.last_error_total);
        self.last_error_total = error_total;

        let counted = if in_startup_grace {
            self.startup_errors = self.startup_errors.saturating_add(new_errors);
            0
        } else {
            self.errors_since_startup = self.errors_since_startup.saturating_add(new_errors);
            new_errors
        };
        self.window_sum = self.window_sum - self.window[self.window_pos] + counted;
        self.window[self.window_pos] = counted;
        self.window_pos = (self.window_pos + 1) % self.window.len();

        if delivered {
            self.missed_cycles = 0;
        } else {
            self.missed_cycles = self.missed_cycles.saturating_add(1);
        }

        let healthy = self.missed_cycles < self.missed_limit && self.window_sum < self.error_threshold;
        if healthy != self.healthy {
            self.healthy = healthy;
            Some(healthy)
        } else {
            None
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn missed_cycles(&self) -> u32 {
        self.missed_cycles
    }

    pub fn window_errors(&self) -> u32 {
        self.window_sum
    }

    /// Errors absorbed during the startup grace period
    pub fn startup_errors(&self) -> u32 {
        self.startup_errors
    }

    pub fn errors_since_startup(&self) -> u32 {
        self.errors_since_startup
    }

    pub fn error_total(&self) -> u32 {
        self.last_error_total
    }
}

/// True if every pair of instances in `set` agrees within `threshold`
pub fn vectors_consistent(values: &[Vec3; MAX_INSTANCES], set: InstanceSet, threshold: f64) -> bool {
    set.iter().all(|i| {
        set.iter()
            .filter(|&j| j > i)
            .all(|j| (values[i] - values[j]).norm() <= threshold)
    })
}

/// With three or more instances, those that disagree with every other one
pub fn outliers(values: &[Vec3; MAX_INSTANCES], set: InstanceSet, threshold: f64) -> InstanceSet {
    let mut out = InstanceSet::empty();
    if set.len() < 3 {
        return out;
    }
    for i in set.iter() {
        let agrees_with_any = set
            .iter()
            .filter(|&j| j != i)
            .any(|j| (values[i] - values[j]).norm() <= threshold);
        if !agrees_with_any {
            out.insert(i);
        }
    }
    out
}

/// Lowest usable instance. Outliers are skipped while anything else is
/// left, and instances that logged errors since startup lose to clean ones.
pub fn select_primary(
    healthy: InstanceSet,
    enabled: InstanceSet,
    outliers: InstanceSet,
    with_errors: InstanceSet,
) -> Option<usize> {
    let usable = healthy.intersection(enabled);
    let voted = usable.difference(outliers);
    let candidates = if voted.is_empty() { usable } else { voted };
    candidates
        .difference(with_errors)
        .first()
        .or_else(|| candidates.first())
}

/// Tracks how long instances have agreed without interruption
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsistencyLatch {
    passing_since_ms: Option<u64>,
}

impl ConsistencyLatch {
    pub fn update(&mut self, consistent: bool, now_ms: u64) {
        if !consistent {
            self.passing_since_ms = None;
        } else if self.passing_since_ms.is_none() {
            self.passing_since_ms = Some(now_ms);
        }
    }

    pub fn consistent_for(&self, window_ms: u64, now_ms: u64) -> bool {
        self.passing_since_ms
            .map_or(false, |since| now_ms.saturating_sub(since) >= window_ms)
    }

    pub fn is_passing(&self) -> bool {
        self.passing_since_ms.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(missed: u32, threshold: u32, window: usize) -> HealthConfig {
        HealthConfig {
            missed_cycle_limit: missed,
            error_threshold: threshold,
            error_window_cycles: window,
            startup_grace_ms: 2000,
        }
    }

    #[test]
    fn test_unhealthy_after_exact_missed_limit() {
        let mut health = InstanceHealth::new(&cfg(3, 10, 10));
        assert_eq!(health.record_cycle(false, 0, false), None);
        assert_eq!(health.record_cycle(false, 0, false), None);
        assert_eq!(health.record_cycle(false, 0, false), Some(false));
        assert!(!health.is_healthy());
        assert_eq!(health.record_cycle(false, 0, false), None);
        assert_eq!(health.record_cycle(true, 0, false), Some(true));
        assert!(health.is_healthy());
    }

    #[test]
    fn test_error_window_rolls_off() {
        let mut health = InstanceHealth::new(&cfg(3, 5, 4));
        assert_eq!(health.record_cycle(true, 5, false), Some(false));
        assert_eq!(health.window_errors(), 5);
        for _ in 0..3 {
            assert_eq!(health.record_cycle(true, 5, false), None);
        }
        // The erroring cycle leaves the window
        assert_eq!(health.record_cycle(true, 5, false), Some(true));
        assert_eq!(health.errors_since_startup(), 5);
    }

    #[test]
    fn test_startup_errors_are_absorbed() {
        let mut health = InstanceHealth::new(&cfg(3, 2, 10));
        assert_eq!(health.record_cycle(true, 50, true), None);
        assert!(health.is_healthy());
        assert_eq!(health.startup_errors(), 50);
        assert_eq!(health.errors_since_startup(), 0);
        health.record_cycle(true, 51, false);
        assert_eq!(health.errors_since_startup(), 1);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_pairwise_consistency() {
        let mut values = [Vec3::zeros(); MAX_INSTANCES];
        values[1] = Vec3::new(0.5, 0.0, 0.0);
        values[2] = Vec3::new(5.0, 0.0, 0.0);
        assert!(vectors_consistent(&values, InstanceSet::from_ids(&[0, 1]), 0.75));
        assert!(!vectors_consistent(&values, InstanceSet::from_ids(&[0, 1]), 0.25));
        assert!(!vectors_consistent(&values, InstanceSet::from_ids(&[0, 1, 2]), 0.75));
        assert!(vectors_consistent(&values, InstanceSet::from_ids(&[2]), 0.0));
    }

    #[test]
    fn test_voting_excludes_lone_outlier() {
        let mut values = [Vec3::zeros(); MAX_INSTANCES];
        values[0] = Vec3::new(3.0, 0.0, 0.0);
        let all = InstanceSet::from_ids(&[0, 1, 2]);
        assert_eq!(outliers(&values, all, 0.75), InstanceSet::from_ids(&[0]));
        assert!(outliers(&values, InstanceSet::from_ids(&[0, 1]), 0.75).is_empty());
        assert_eq!(select_primary(all, all, InstanceSet::from_ids(&[0]), InstanceSet::empty()), Some(1));
    }

    #[test]
    fn test_primary_prefers_clean_instances() {
        let all = InstanceSet::from_ids(&[0, 1]);
        let errs = InstanceSet::from_ids(&[0]);
        assert_eq!(select_primary(all, all, InstanceSet::empty(), errs), Some(1));
        assert_eq!(select_primary(all, all, InstanceSet::empty(), all), Some(0));
        assert_eq!(select_primary(InstanceSet::from_ids(&[1]), all, InstanceSet::empty(), InstanceSet::empty()), Some(1));
        assert_eq!(select_primary(all, InstanceSet::from_ids(&[2]), InstanceSet::empty(), InstanceSet::empty()), None);
    }

    #[test]
    fn test_latch_requires_uninterrupted_window() {
        let mut latch = ConsistencyLatch::default();
        latch.update(true, 1000);
        assert!(!latch.consistent_for(10_000, 5000));
        assert!(latch.consistent_for(10_000, 11_000));
        latch.update(false, 11_500);
        latch.update(true, 12_000);
        assert!(!latch.consistent_for(10_000, 20_000));
        assert!(latch.consistent_for(10_000, 22_000));
    }
}
