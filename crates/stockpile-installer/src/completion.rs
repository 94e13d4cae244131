use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// A write-once result shared between one producer and any number of
/// waiters.
///
/// Clones observe the same slot. The first [`complete`](Self::complete)
/// wins; later calls are ignored. Waiting threads block on a condition
/// variable, so there is no busy polling unless the caller asks for it
/// with [`wait_while`](Self::wait_while).
#[derive(Debug)]
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                value: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// An already-resolved completion.
    pub fn resolved(value: T) -> Self {
        let c = Self::new();
        c.complete(value);
        c
    }

    /// Store `value` and wake all waiters. Returns `false` if a value was
    /// already present.
    pub fn complete(&self, value: T) -> bool {
        let mut guard = self
            .slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        drop(guard);
        self.slot.ready.notify_all();
        true
    }

    pub fn is_complete(&self) -> bool {
        self.peek().is_some()
    }

    pub fn peek(&self) -> Option<T> {
        self.slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until a value is available.
    pub fn wait(&self) -> T {
        let mut guard = self
            .slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(ref value) = *guard {
                return value.clone();
            }
            guard = self
                .slot
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(ref value) = *guard {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = self
                .slot
                .ready
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Block until a value arrives or `should_stop` returns true, checking
    /// `should_stop` every `poll`. Returns `None` when stopped first.
    pub fn wait_while(&self, should_stop: &dyn Fn() -> bool, poll: Duration) -> Option<T> {
        loop {
            if let Some(value) = self.wait_timeout(poll) {
                return Some(value);
            }
            if should_stop() {
                return self.peek();
            }
        }
    }
}
