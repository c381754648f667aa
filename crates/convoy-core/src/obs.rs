//! Observability for batch lifecycle events.
//!
//! This module provides:
//! - The [`Observer`] hook (`increment` / `timing`) called at attempt, call
//!   and wave boundaries. Defaults to [`NoopObserver`].
//! - Batch-scoped tracing spans via the [`BatchSpan`] RAII guard
//! - Emission functions for structured lifecycle events
//!
//! Events are emitted at `info!` level; per-call detail at `debug!`.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

pub const ATTEMPT_STARTED: &str = "convoy.attempt.started";
pub const CALL_SUCCEEDED: &str = "convoy.call.succeeded";
pub const CALL_FAILED: &str = "convoy.call.failed";
pub const CALL_RETRIED: &str = "convoy.call.retried";
pub const CALL_SOFT_TIMEOUT: &str = "convoy.call.soft_timeout";
pub const CALL_SKIPPED: &str = "convoy.call.skipped";
pub const WAVE_STARTED: &str = "convoy.wave.started";
pub const WAVE_COMPLETED: &str = "convoy.wave.completed";
pub const WAVE_SKIPPED: &str = "convoy.wave.skipped";
pub const CALL_DURATION_MS: &str = "convoy.call.duration_ms";
pub const WAVE_DURATION_MS: &str = "convoy.wave.duration_ms";

/// Key/value tags attached to a metric.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Sink for counters and timings.
///
/// Implementations must be cheap and must not fail; they are called from
/// inside the executor's hot path.
pub trait Observer: Send + Sync {
    fn increment(&self, name: &str, tags: Tags<'_>);
    fn timing(&self, name: &str, value_ms: u64, tags: Tags<'_>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn increment(&self, _name: &str, _tags: Tags<'_>) {}
    fn timing(&self, _name: &str, _value_ms: u64, _tags: Tags<'_>) {}
}

/// Forwards every hook call as a `trace!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn increment(&self, name: &str, tags: Tags<'_>) {
        tracing::trace!(metric = %name, tags = ?tags, "counter incremented");
    }

    fn timing(&self, name: &str, value_ms: u64, tags: Tags<'_>) {
        tracing::trace!(metric = %name, value_ms, tags = ?tags, "timing recorded");
    }
}

/// Forwards every hook call to each inner observer in order.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    inner: Vec<Arc<dyn Observer>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.inner.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Observer for FanoutObserver {
    fn increment(&self, name: &str, tags: Tags<'_>) {
        for observer in &self.inner {
            observer.increment(name, tags);
        }
    }

    fn timing(&self, name: &str, value_ms: u64, tags: Tags<'_>) {
        for observer in &self.inner {
            observer.timing(name, value_ms, tags);
        }
    }
}

/// A recorded hook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Increment {
        name: String,
        tags: Vec<(String, String)>,
    },
    Timing {
        name: String,
        value_ms: u64,
        tags: Vec<(String, String)>,
    },
}

/// Keeps every hook call in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    calls: Mutex<Vec<Recorded>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of increments recorded under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Recorded::Increment { name: n, .. } if n == name))
            .count()
    }

    fn push(&self, call: Recorded) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

fn owned_tags(tags: Tags<'_>) -> Vec<(String, String)> {
    tags.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Observer for RecordingObserver {
    fn increment(&self, name: &str, tags: Tags<'_>) {
        self.push(Recorded::Increment {
            name: name.to_string(),
            tags: owned_tags(tags),
        });
    }

    fn timing(&self, name: &str, value_ms: u64, tags: Tags<'_>) {
        self.push(Recorded::Timing {
            name: name.to_string(),
            value_ms,
            tags: owned_tags(tags),
        });
    }
}

/// RAII guard that enters a batch-scoped tracing span for the duration of a
/// batch.
///
/// ```ignore
/// let _span = BatchSpan::enter("3f1c...");
/// // every event below carries batch_id = "3f1c..."
/// ```
pub struct BatchSpan {
    _span: tracing::span::EnteredSpan,
}

impl BatchSpan {
    pub fn enter(batch_id: &str) -> Self {
        Self {
            _span: batch_span(batch_id).entered(),
        }
    }
}

/// The span [`BatchSpan`] enters. Async code attaches it with
/// `tracing::Instrument` instead, since an entered span must not be held
/// across an `.await`.
pub fn batch_span(batch_id: &str) -> tracing::Span {
    tracing::info_span!("convoy.batch", batch_id = %batch_id)
}

pub fn emit_batch_started(batch_id: &str, route: &str, mode: &str, specs: usize) {
    info!(
        event = "batch.started",
        batch_id = %batch_id,
        route = %route,
        mode = %mode,
        specs = specs,
    );
}

pub fn emit_batch_finished(batch_id: &str, duration_ms: u64, results: usize, ok: bool) {
    info!(
        event = "batch.finished",
        batch_id = %batch_id,
        duration_ms = duration_ms,
        results = results,
        ok = ok,
    );
}

/// Emit event: batch rejected before any call ran.
pub fn emit_batch_rejected(batch_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "batch.rejected", batch_id = %batch_id, error = %error);
}

pub fn emit_wave_started(wave: usize, size: usize) {
    info!(event = "wave.started", wave = wave, size = size);
}

pub fn emit_wave_finished(wave: usize, duration_ms: u64, failed: usize) {
    info!(
        event = "wave.finished",
        wave = wave,
        duration_ms = duration_ms,
        failed = failed,
    );
}

/// Emit event: the global budget was exceeded and waves were skipped.
pub fn emit_deadline_breached(at_wave: usize, elapsed_ms: u64, budget_ms: u64, skipped: usize) {
    warn!(
        event = "deadline.breached",
        wave = at_wave,
        elapsed_ms = elapsed_ms,
        budget_ms = budget_ms,
        skipped_calls = skipped,
    );
}

pub fn emit_call_finished(alias: &str, attempt: u32, elapsed_ms: u64, ok: bool) {
    debug!(
        event = "call.finished",
        alias = %alias,
        attempt = attempt,
        elapsed_ms = elapsed_ms,
        ok = ok,
    );
}

pub fn emit_call_failed(alias: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(event = "call.failed", alias = %alias, attempt = attempt, error = %error);
}

pub fn emit_call_skipped(alias: &str, reason: &str) {
    info!(event = "call.skipped", alias = %alias, reason = %reason);
}
