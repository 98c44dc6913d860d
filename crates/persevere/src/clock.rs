//! Injectable UTC clock
//!
//! The dispatcher's timer and every workflow's virtual clock consult the
//! same [`Clock`] instance, so tests can drive time explicitly with
//! [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;

/// Source of the current UTC time
///
/// Production code uses [`SystemClock`]; tests inject a [`ManualClock`] and
/// advance it by hand.
pub trait Clock: Send + Sync + 'static {
    /// Current UTC time
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests
///
/// # Example
///
/// ```
/// use persevere::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::starting_now();
/// let before = clock.utc_now();
/// clock.advance(Duration::from_secs(30));
/// assert_eq!((clock.utc_now() - before).num_seconds(), 30);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock at the given instant
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Create a manual clock at the real current time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: std::time::Duration) {
        let delta = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        let mut now = self.now.write();
        *now += delta;
    }

    /// Set the clock to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
