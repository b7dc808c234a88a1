//! Time source for freshness decisions.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of "now" for the cache.
///
/// Freshness is always evaluated against this clock at read time, so swapping
/// in a [`ManualClock`] gives tests full control over entry age.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Move the clock forward (or backward, for a negative duration).
  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}
