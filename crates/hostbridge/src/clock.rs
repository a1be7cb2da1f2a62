use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotonic time source for the scheduler and the retry backoff.
pub trait Clock: Send + Sync {
  fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<Instant>>,
}

impl ManualClock {
  #[must_use]
  pub fn new() -> Self {
    Self {
      now: Arc::new(Mutex::new(Instant::now())),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock();
    *now += by;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Instant {
    *self.now.lock()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn manual_clock_clones_share_time() {
    let clock = ManualClock::new();
    let other = clock.clone();
    let start = clock.now();
    other.advance(Duration::from_millis(250));
    assert_eq!(clock.now() - start, Duration::from_millis(250));
  }
}
