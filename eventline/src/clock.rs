//! Time source injected into the engine and retry strategies.

use crate::types::Timestamp;
use parking_lot::Mutex;
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Timestamp;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
///
/// Used by tests that need deterministic retry backoff.
#[derive(Debug)]
pub struct FrozenClock {
    now: Mutex<Timestamp>,
}

impl FrozenClock {
    /// Freezes time at `now`.
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now = now.plus(duration);
    }

    /// Jumps to an arbitrary instant.
    pub fn set(&self, now: Timestamp) {
        *self.now.lock() = now;
    }
}

impl Default for FrozenClock {
    fn default() -> Self {
        Self::new(Timestamp::now())
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock_only_moves_on_advance() {
        let start = Timestamp::now();
        let clock = FrozenClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now(), start.plus(Duration::from_secs(3)));
    }
}
