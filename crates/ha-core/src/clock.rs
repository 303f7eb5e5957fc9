//! Injectable time source
//!
//! Everything that needs "now" (event timestamps, state timestamps, the
//! scheduler's registration time) reads it from a [`Clock`], so the whole
//! core can be driven deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A source of the current UTC time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A controllable clock for tests and simulations
#[derive(Clone)]
pub struct ManualClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(time)),
        }
    }

    /// Move the clock to an arbitrary instant (backwards is allowed)
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current.write() = time;
    }

    /// Advance the clock by a duration
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.write();
        *current += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManualClock").field(&self.now()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::at(start);

        clock.advance(Duration::hours(1));
        assert_eq!(clock.now().hour(), 1);
        assert_eq!((clock.now() - start).num_seconds(), 3600);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 15, 12, 30, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());

        let later = Utc.with_ymd_and_hms(2025, 6, 15, 13, 0, 0).unwrap();
        clock.set(later);
        assert_eq!(shared.now(), later);
    }
}
