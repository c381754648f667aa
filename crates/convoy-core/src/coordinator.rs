//! End-to-end batch coordination: normalize, plan, execute, merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::deadline::{Clock, SystemClock};
use crate::error::{ConvoyError, ConvoyResult};
use crate::executor::{AliasStatusMap, CallOutcome, WaveExecutor};
use crate::merge::merge_results;
use crate::normalize::{batch_fingerprint, normalize_specs, CallSpec};
use crate::obs::{self, BatchSpan, NoopObserver, Observer};
use crate::planner::{plan, ExecutionMode, Wave};
use crate::policy::{Policy, RetryPolicy};
use crate::registry::{AgentRegistry, PrefetchCache};
use crate::result::{MergedResult, EXECUTIVE_SUMMARY, KEY_FINDINGS};

/// Sections a strict-merge batch must produce.
pub const MANDATORY_SECTIONS: [&str; 2] = [EXECUTIVE_SUMMARY, KEY_FINDINGS];

fn default_route() -> String {
    "default".to_string()
}

/// One top-level coordination request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Free-form label used in logs.
    #[serde(default = "default_route")]
    pub route: String,
    /// `single`, `parallel` or `sequential`.
    pub mode: String,
    pub specs: Vec<CallSpec>,
    /// Read-only data handed to every call.
    #[serde(default)]
    pub prefetch: BTreeMap<String, serde_json::Value>,
    /// Run with the policy's crisis parallelism.
    #[serde(default)]
    pub crisis: bool,
}

impl BatchRequest {
    pub fn new(mode: impl Into<String>, specs: Vec<CallSpec>) -> Self {
        Self {
            route: default_route(),
            mode: mode.into(),
            specs,
            prefetch: BTreeMap::new(),
            crisis: false,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_prefetch(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.prefetch.insert(key.into(), value);
        self
    }

    pub fn crisis(mut self) -> Self {
        self.crisis = true;
        self
    }
}

/// A validated, planned batch that has not run yet.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub mode: ExecutionMode,
    pub parallelism: usize,
    pub fingerprint: String,
    pub waves: Vec<Wave>,
}

/// Outcome of a completed batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub fingerprint: String,
    pub mode: ExecutionMode,
    pub merged: MergedResult,
    pub outcomes: Vec<CallOutcome>,
    pub statuses: AliasStatusMap,
    pub elapsed_ms: u64,
    pub deadline_breached: bool,
}

/// Runs batches against a registry under one policy.
#[derive(Clone)]
pub struct Coordinator {
    registry: Arc<dyn AgentRegistry>,
    policy: Policy,
    retry: RetryPolicy,
    observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    pub fn new(registry: Arc<dyn AgentRegistry>, policy: Policy) -> Self {
        Self {
            registry,
            policy,
            retry: RetryPolicy::default(),
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Validate and plan `request` without running anything.
    pub fn plan(&self, request: &BatchRequest) -> ConvoyResult<BatchPlan> {
        let mode: ExecutionMode = request.mode.parse()?;
        let normalized = normalize_specs(self.registry.as_ref(), &request.specs)?;
        let fingerprint = batch_fingerprint(&normalized);
        let parallelism = self.policy.effective_parallelism(request.crisis);
        let waves = plan(&request.route, normalized, mode, parallelism)?;
        Ok(BatchPlan {
            mode,
            parallelism,
            fingerprint,
            waves,
        })
    }

    /// Run `request` to completion.
    ///
    /// Configuration problems fail before any agent is called. Everything
    /// else ends up inside the merged result.
    pub async fn run(&self, request: BatchRequest) -> ConvoyResult<BatchReport> {
        let batch_id = Uuid::new_v4().to_string();
        let span = obs::batch_span(&batch_id);
        self.run_inner(batch_id, request).instrument(span).await
    }

    async fn run_inner(
        &self,
        batch_id: String,
        request: BatchRequest,
    ) -> ConvoyResult<BatchReport> {
        let started = self.clock.now();

        let planned = match self.plan(&request) {
            Ok(planned) => planned,
            Err(e) => {
                obs::emit_batch_rejected(&batch_id, &e);
                return Err(e);
            }
        };
        obs::emit_batch_started(
            &batch_id,
            &request.route,
            planned.mode.as_str(),
            request.specs.len(),
        );

        let executor = WaveExecutor::new(self.policy.clone())
            .with_parallelism(planned.parallelism)
            .with_retry_policy(self.retry.clone())
            .with_observer(Arc::clone(&self.observer))
            .with_clock(Arc::clone(&self.clock));
        let prefetch = PrefetchCache::new(request.prefetch);
        let execution = executor
            .execute(planned.waves, planned.mode, &prefetch)
            .await?;

        let merged = merge_results(&execution.results())?;

        if self.policy.strict_merge() {
            let missing: Vec<String> = MANDATORY_SECTIONS
                .iter()
                .filter(|title| !merged.has_section(title))
                .map(|title| title.to_string())
                .collect();
            if !missing.is_empty() {
                let err = ConvoyError::StrictMergeViolation { missing };
                obs::emit_batch_rejected(&batch_id, &err);
                return Err(err);
            }
        }

        let elapsed_ms = self.clock.now().saturating_sub(started).as_millis() as u64;
        obs::emit_batch_finished(&batch_id, elapsed_ms, execution.outcomes.len(), merged.ok);

        Ok(BatchReport {
            batch_id,
            fingerprint: planned.fingerprint,
            mode: planned.mode,
            merged,
            outcomes: execution.outcomes,
            statuses: execution.statuses,
            elapsed_ms,
            deadline_breached: execution.deadline_breached,
        })
    }
}

/// Plan a batch under a fresh batch span and log the result. Used by tooling
/// that inspects plans without running them.
pub fn preview(coordinator: &Coordinator, request: &BatchRequest) -> ConvoyResult<BatchPlan> {
    let batch_id = Uuid::new_v4().to_string();
    let _span = BatchSpan::enter(&batch_id);
    match coordinator.plan(request) {
        Ok(planned) => {
            tracing::info!(
                event = "batch.planned",
                batch_id = %batch_id,
                mode = %planned.mode,
                waves = planned.waves.len(),
                fingerprint = %planned.fingerprint,
            );
            Ok(planned)
        }
        Err(e) => {
            obs::emit_batch_rejected(&batch_id, &e);
            Err(e)
        }
    }
}
