//! Wall-clock abstraction for the scheduler.
//!
//! The scheduler reads "now" through this seam so tests can inject a
//! controlled clock instead of the platform one.

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The platform wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
