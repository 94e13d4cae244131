//! Filters that thin out progress callbacks.
//!
//! Neither filter changes the work being reported on; they only decide
//! which events reach the downstream receiver.

use stockpile_schema::{Clock, RateCounter};

/// Forward roughly `budget` events over `total` units.
///
/// An event is forwarded once the position has advanced by at least
/// `total / budget` since the last forwarded one. Reaching `total` is
/// always forwarded so receivers see completion.
#[derive(Debug, Clone)]
pub struct CountThrottle {
    divider: u64,
    total: u64,
    last: u64,
    finished: bool,
}

impl CountThrottle {
    pub fn new(total: u64, budget: u64) -> Self {
        Self {
            divider: (total / budget.max(1)).max(1),
            total,
            last: 0,
            finished: false,
        }
    }

    pub fn divider(&self) -> u64 {
        self.divider
    }

    pub fn admit(&mut self, current: u64) -> bool {
        if self.finished {
            return false;
        }
        if current >= self.total {
            self.finished = true;
        } else if current.saturating_sub(self.last) < self.divider {
            return false;
        }
        self.last = current;
        true
    }
}

/// Forward at most one event per second, with a rate derived from the
/// position change since the last forwarded event.
#[derive(Debug, Clone)]
pub struct TimeThrottle {
    last_at: Option<u64>,
    rate: RateCounter,
}

impl TimeThrottle {
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            last_at: None,
            rate: RateCounter::new(clock.now_millis()),
        }
    }

    /// `Some(bytes per second)` when the event should be forwarded.
    pub fn admit(&mut self, clock: &dyn Clock, current: u64) -> Option<u64> {
        let now = clock.now_millis();
        let due = self.last_at.is_none_or(|at| now.saturating_sub(at) >= 1000);
        if !due {
            return None;
        }
        self.last_at = Some(now);
        Some(self.rate.update(now, current))
    }
}
