use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic time source, injected so rate calculations are testable.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since an arbitrary, fixed origin.
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Bytes-per-second estimate, resampled at most once per second.
///
/// The rate is `(bytes since last sample) / (elapsed seconds)` and never
/// goes negative.
#[derive(Debug, Clone)]
pub struct RateCounter {
    sample_at: u64,
    sample_bytes: u64,
    per_second: u64,
}

impl RateCounter {
    pub fn new(now_millis: u64) -> Self {
        Self {
            sample_at: now_millis,
            sample_bytes: 0,
            per_second: 0,
        }
    }

    /// Record `total` bytes processed at `now_millis` and return the
    /// current estimate.
    pub fn update(&mut self, now_millis: u64, total: u64) -> u64 {
        let elapsed = now_millis.saturating_sub(self.sample_at);
        if elapsed >= 1000 {
            let delta = total.saturating_sub(self.sample_bytes);
            self.per_second = delta * 1000 / elapsed;
            self.sample_at = now_millis;
            self.sample_bytes = total;
        }
        self.per_second
    }

    pub fn per_second(&self) -> u64 {
        self.per_second
    }
}
