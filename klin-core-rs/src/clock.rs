//! Time sources for the message bus
//!
//! The bus never reads wall time directly. `MonotonicClock` is used for
//! real-time runs; `ManualClock` is advanced by the simulation loop so
//! discrete-time runs are reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Elapsed time since the clock was created. Never decreases.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall-clock time since construction
#[derive(Debug, Clone)]
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
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Simulated time, advanced explicitly (nanosecond resolution)
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `dt`
    pub fn advance(&self, dt: Duration) {
        self.nanos
            .fetch_add(dt.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to `t`; earlier values are ignored so time never runs backwards
    pub fn set(&self, t: Duration) {
        self.nanos.fetch_max(t.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}
