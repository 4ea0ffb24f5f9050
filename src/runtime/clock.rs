//! Monotonic clock capability with a controllable test double.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source for deadlines and record timestamps.
pub trait Clock: Send + Sync {
    /// Monotonic instant for elapsed-time math.
    fn now(&self) -> Instant;
    /// Absolute UTC time for persisted records.
    fn utc_now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Frozen clock advanced manually by tests.
#[derive(Clone)]
pub struct FrozenClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl FrozenClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for FrozenClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A wall-clock budget anchored to a clock.
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, budget: Duration) -> Self {
        Self {
            started: clock.now(),
            budget,
        }
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.now().duration_since(self.started) >= self.budget
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.budget
            .saturating_sub(clock.now().duration_since(self.started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock_advances_only_on_demand() {
        let clock = FrozenClock::new();
        let deadline = Deadline::after(&clock, Duration::from_secs(10));
        assert!(!deadline.expired(&clock));
        clock.advance(Duration::from_secs(11));
        assert!(deadline.expired(&clock));
        assert_eq!(deadline.remaining(&clock), Duration::ZERO);
    }
}
