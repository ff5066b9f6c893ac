//! Time source for everything that timestamps, sleeps, or measures age.
//!
//! Agents never call `Utc::now()` or `thread::sleep` directly; they go through
//! [`Clock`] so tests can drive settle delays, build-status polling, and stale
//! lock timeouts without real waiting.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Wall clock with real blocking sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock: `sleep` advances time instantly. Clones share one timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
    slept: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
            slept: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.now.set(at);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + to_delta(by));
    }

    /// Total time spent in `sleep` so far.
    pub fn slept(&self) -> Duration {
        self.slept.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.set(self.slept.get() + duration);
        self.advance(duration);
    }
}

/// Convert a std duration to a chrono delta, saturating on overflow.
pub fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
