//! Global time budget across waves.
//!
//! Time is read through a [`Clock`] so tests can drive it by hand.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Wall-clock time backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
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
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// Tracks cumulative elapsed time for one batch against a fixed budget.
///
/// The budget is only sampled at the points the executor asks; nothing here
/// interrupts running work.
pub struct DeadlineTracker<'a> {
    clock: &'a dyn Clock,
    started: Duration,
    budget: Duration,
}

impl<'a> DeadlineTracker<'a> {
    /// Start the budget now.
    pub fn start(clock: &'a dyn Clock, budget_ms: u64) -> Self {
        Self {
            clock,
            started: clock.now(),
            budget: Duration::from_millis(budget_ms),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.started)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }

    /// True once elapsed time is strictly over budget.
    pub fn is_breached(&self) -> bool {
        self.elapsed() > self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }
}

impl fmt::Debug for DeadlineTracker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineTracker")
            .field("elapsed_ms", &self.elapsed_ms())
            .field("budget_ms", &self.budget_ms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breach_is_strictly_over_budget() {
        let clock = ManualClock::new();
        clock.advance_ms(500);
        let tracker = DeadlineTracker::start(&clock, 1000);
        assert!(!tracker.is_breached());

        clock.advance_ms(1000);
        assert_eq!(tracker.elapsed_ms(), 1000);
        assert!(!tracker.is_breached());

        clock.advance_ms(1);
        assert!(tracker.is_breached());
        assert_eq!(tracker.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
