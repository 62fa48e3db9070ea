//! Job counter: tracks how many outstanding jobs a caller is waiting
//! on.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};

/// A 32-bit counter incremented once per job submitted against it and
/// decremented once per job that finishes running.
///
/// A [`JobCounter`] reaching zero wakes every fiber blocked on it via
/// [`crate::job::JobSystem::wait`]. It has no meaning beyond counting;
/// callers typically allocate one per logical batch of work and
/// discard it once the wait returns.
#[derive(Default)]
pub struct JobCounter {
    count: AtomicI32,
}

impl JobCounter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        JobCounter { count: AtomicI32::new(0) }
    }

    /// Increments the counter, failing rather than wrapping if it
    /// would overflow `i32::MAX`.
    pub(crate) fn increment(&self) -> Result<()> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(1).ok_or(Error::CounterOverflow)?;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrements the counter and returns the value after
    /// decrementing.
    pub(crate) fn decrement(&self) -> i32 {
        self.count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Returns the current value.
    pub fn get(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }
}
