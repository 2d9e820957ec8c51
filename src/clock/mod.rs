//! Time source abstraction
//!
//! Every component that does TTL or refill arithmetic reads the wall clock
//! through [`TimeSource`] instead of calling `Utc::now()` directly, so tests
//! can drive time deterministically with [`ManualClock`].

use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// A source of wall-clock time
pub trait TimeSource: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a time source
pub type SharedClock = Arc<dyn TimeSource>;

/// Real wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Create a shared system clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Manually advanced clock for tests
///
/// Starts at the moment of construction and only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at the current wall-clock time
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    /// Create a clock frozen at a specific time
    pub fn starting_at(t: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(t) }
    }

    /// Advance the clock by a duration
    pub fn advance(&self, d: std::time::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero());
    }

    /// Jump the clock to a specific time
    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.lock().unwrap() = t;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
