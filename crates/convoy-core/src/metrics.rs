//! Global atomic counters for convoy.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a batch).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::obs::{self, Observer, Tags};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters. No allocations, no locking.
pub struct Metrics {
    attempts_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    calls_retried: AtomicU64,
    soft_timeouts: AtomicU64,
    calls_skipped: AtomicU64,
    waves_completed: AtomicU64,
    waves_skipped: AtomicU64,
    call_time_ms: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            attempts_started: AtomicU64::new(0),
            calls_succeeded: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            calls_retried: AtomicU64::new(0),
            soft_timeouts: AtomicU64::new(0),
            calls_skipped: AtomicU64::new(0),
            waves_completed: AtomicU64::new(0),
            waves_skipped: AtomicU64::new(0),
            call_time_ms: AtomicU64::new(0),
        }
    }

    fn counter(&self, name: &str) -> Option<&AtomicU64> {
        match name {
            obs::ATTEMPT_STARTED => Some(&self.attempts_started),
            obs::CALL_SUCCEEDED => Some(&self.calls_succeeded),
            obs::CALL_FAILED => Some(&self.calls_failed),
            obs::CALL_RETRIED => Some(&self.calls_retried),
            obs::CALL_SOFT_TIMEOUT => Some(&self.soft_timeouts),
            obs::CALL_SKIPPED => Some(&self.calls_skipped),
            obs::WAVE_COMPLETED => Some(&self.waves_completed),
            obs::WAVE_SKIPPED => Some(&self.waves_skipped),
            _ => None,
        }
    }

    /// Increment the counter registered under `name`. Unknown names are
    /// ignored.
    pub fn inc(&self, name: &str) {
        if let Some(counter) = self.counter(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = %name, "counter incremented");
        }
    }

    /// Add to the cumulative agent call time.
    pub fn add_call_time(&self, ms: u64) {
        self.call_time_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a batch, CLI exit, ...)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            attempts_started = self.attempts_started(),
            calls_succeeded = self.calls_succeeded(),
            calls_failed = self.calls_failed(),
            calls_retried = self.calls_retried(),
            soft_timeouts = self.soft_timeouts(),
            calls_skipped = self.calls_skipped(),
            waves_completed = self.waves_completed(),
            waves_skipped = self.waves_skipped(),
            call_time_ms = self.call_time_ms(),
        );
    }

    pub fn attempts_started(&self) -> u64 {
        self.attempts_started.load(Ordering::Relaxed)
    }

    pub fn calls_succeeded(&self) -> u64 {
        self.calls_succeeded.load(Ordering::Relaxed)
    }

    pub fn calls_failed(&self) -> u64 {
        self.calls_failed.load(Ordering::Relaxed)
    }

    pub fn calls_retried(&self) -> u64 {
        self.calls_retried.load(Ordering::Relaxed)
    }

    pub fn soft_timeouts(&self) -> u64 {
        self.soft_timeouts.load(Ordering::Relaxed)
    }

    pub fn calls_skipped(&self) -> u64 {
        self.calls_skipped.load(Ordering::Relaxed)
    }

    pub fn waves_completed(&self) -> u64 {
        self.waves_completed.load(Ordering::Relaxed)
    }

    pub fn waves_skipped(&self) -> u64 {
        self.waves_skipped.load(Ordering::Relaxed)
    }

    pub fn call_time_ms(&self) -> u64 {
        self.call_time_ms.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.attempts_started,
            &self.calls_succeeded,
            &self.calls_failed,
            &self.calls_retried,
            &self.soft_timeouts,
            &self.calls_skipped,
            &self.waves_completed,
            &self.waves_skipped,
            &self.call_time_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// [`Observer`] that feeds a [`Metrics`] instance, by default [`METRICS`].
#[derive(Clone, Copy)]
pub struct MetricsObserver {
    metrics: &'static Metrics,
}

impl MetricsObserver {
    pub fn new(metrics: &'static Metrics) -> Self {
        Self { metrics }
    }
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new(&METRICS)
    }
}

impl Observer for MetricsObserver {
    fn increment(&self, name: &str, _tags: Tags<'_>) {
        self.metrics.inc(name);
    }

    fn timing(&self, name: &str, value_ms: u64, _tags: Tags<'_>) {
        if name == obs::CALL_DURATION_MS {
            self.metrics.add_call_time(value_ms);
        }
    }
}
