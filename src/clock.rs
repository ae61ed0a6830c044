//! Time sources for the sample loop.
//!
//! The synchronizer only ever asks for "now" and "sleep", so tests swap the
//! monotonic clock for [`SimClock`], where sleeping simply advances time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Microseconds since the clock was created
    fn now_us(&self) -> u64;

    /// Block (or advance simulated time) for `us` microseconds
    fn sleep_us(&self, us: u64);

    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }

    /// Saturating elapsed time since `reference_us`
    fn elapsed_since(&self, reference_us: u64) -> u64 {
        self.now_us().saturating_sub(reference_us)
    }
}

/// Wall clock backed by `Instant`
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn sleep_us(&self, us: u64) {
        if us > 0 {
            std::thread::sleep(Duration::from_micros(us));
        }
    }
}

/// Deterministic clock shared between the loop and simulated backends
#[derive(Clone, Debug, Default)]
pub struct SimClock {
    now: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::with_initial(0)
    }

    pub fn with_initial(us: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(us)),
        }
    }

    pub fn set(&self, us: u64) {
        self.now.store(us, Ordering::SeqCst);
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_us(&self, us: u64) {
        self.advance(us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_clock_sleep_advances() {
        let clock = SimClock::new();
        assert_eq!(clock.now_us(), 0);
        clock.sleep_us(2500);
        assert_eq!(clock.now_us(), 2500);
        assert_eq!(clock.now_ms(), 2);
    }

    #[test]
    fn test_sim_clock_shared_between_clones() {
        let clock = SimClock::with_initial(1_000);
        let other = clock.clone();
        other.advance(500);
        assert_eq!(clock.now_us(), 1_500);
        assert_eq!(clock.elapsed_since(1_200), 300);
        assert_eq!(clock.elapsed_since(5_000), 0);
    }

    #[test]
    fn test_monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now_us();
        clock.sleep_us(200);
        let b = clock.now_us();
        assert!(b >= a + 200);
    }
}
