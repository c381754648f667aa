//! Wave execution with bounded concurrency, per-call failure isolation and
//! a global deadline sampled between waves.
//!
//! Agents are blocking, so every attempt runs on tokio's blocking pool via
//! `spawn_blocking`. Within a concurrent wave a semaphore bounds the number
//! of calls in flight and a `JoinSet` collects them as they finish. Only the
//! collecting task writes the [`AliasStatusMap`], so it needs no lock.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, instrument, warn};

use crate::deadline::{Clock, DeadlineTracker, SystemClock};
use crate::error::{AgentError, ConvoyError, ConvoyResult, ErrorKind};
use crate::normalize::NormalizedSpec;
use crate::obs::{self, NoopObserver, Observer};
use crate::placeholder::{from_report, placeholder};
use crate::planner::{ExecutionMode, Wave};
use crate::policy::{Policy, RetryPolicy};
use crate::registry::PrefetchCache;
use crate::result::{ExecutionTrace, PartialResult};

/// alias -> whether its call succeeded. Written once per alias.
pub type AliasStatusMap = BTreeMap<String, bool>;

/// Trace and result of one spec, executed or skipped.
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub alias: String,
    /// 0-indexed wave the spec was planned into.
    pub wave: usize,
    pub trace: ExecutionTrace,
    pub result: PartialResult,
    /// Position of the spec in the flattened plan.
    #[serde(skip)]
    index: usize,
}

impl CallOutcome {
    pub fn ok(&self) -> bool {
        self.result.ok
    }
}

/// Everything the executor produced for a batch.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// One outcome per planned spec, in plan order.
    pub outcomes: Vec<CallOutcome>,
    pub statuses: AliasStatusMap,
    pub elapsed_ms: u64,
    /// Whether the global budget stopped the batch early.
    pub deadline_breached: bool,
}

impl ExecutionReport {
    pub fn results(&self) -> Vec<PartialResult> {
        self.outcomes.iter().map(|o| o.result.clone()).collect()
    }

    pub fn traces(&self) -> Vec<ExecutionTrace> {
        self.outcomes.iter().map(|o| o.trace.clone()).collect()
    }
}

/// Runs planned waves under a [`Policy`].
#[derive(Clone)]
pub struct WaveExecutor {
    policy: Policy,
    parallelism: usize,
    retry: RetryPolicy,
    observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
}

impl WaveExecutor {
    pub fn new(policy: Policy) -> Self {
        Self {
            parallelism: policy.max_parallel(),
            policy,
            retry: RetryPolicy::default(),
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Override the concurrent-call bound (e.g. the crisis parallelism).
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
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

    fn runner(&self) -> CallRunner {
        CallRunner {
            retry: self.retry.clone(),
            observer: Arc::clone(&self.observer),
            clock: Arc::clone(&self.clock),
            max_attempts: self.policy.max_attempts(),
            backoff_ms: self.policy.retry_backoff_ms(),
            timeout_ms: self.policy.per_agent_timeout_ms(),
        }
    }

    /// Run `waves` in order.
    ///
    /// Every planned spec yields exactly one outcome. Per-call failures,
    /// soft timeouts, failed dependencies and deadline breaches all become
    /// failed outcomes; the only error is a batch that produced nothing.
    #[instrument(skip_all, fields(mode = %mode, waves = waves.len()))]
    pub async fn execute(
        &self,
        waves: Vec<Wave>,
        mode: ExecutionMode,
        prefetch: &PrefetchCache,
    ) -> ConvoyResult<ExecutionReport> {
        let tracker = DeadlineTracker::start(self.clock.as_ref(), self.policy.total_timeout_ms());
        let mut state = BatchState::default();
        let mut deadline_breached = false;

        let mut remaining = waves.into_iter();
        while let Some(wave) = remaining.next() {
            if tracker.is_breached() {
                let reason = format!(
                    "timeout breached before wave {} ({} ms > {} ms budget)",
                    wave.number(),
                    tracker.elapsed_ms(),
                    tracker.budget_ms()
                );
                let first = wave.number();
                let skipped = std::iter::once(wave).chain(remaining.by_ref());
                let count = self.skip_waves(skipped, &reason, &mut state);
                obs::emit_deadline_breached(
                    first,
                    tracker.elapsed_ms(),
                    tracker.budget_ms(),
                    count,
                );
                deadline_breached = true;
                break;
            }

            let number = wave.number();
            debug!(
                wave = number,
                remaining_ms = tracker.remaining().as_millis() as u64,
                "batch budget before wave"
            );
            self.run_wave(wave, mode, prefetch, &mut state).await;

            if tracker.is_breached() && remaining.len() > 0 {
                let reason = format!(
                    "timeout breached after wave {number} ({} ms > {} ms budget)",
                    tracker.elapsed_ms(),
                    tracker.budget_ms()
                );
                let count = self.skip_waves(remaining.by_ref(), &reason, &mut state);
                obs::emit_deadline_breached(
                    number + 1,
                    tracker.elapsed_ms(),
                    tracker.budget_ms(),
                    count,
                );
                deadline_breached = true;
                break;
            }
        }

        if state.outcomes.is_empty() {
            return Err(ConvoyError::NoResults);
        }

        let mut outcomes = state.outcomes;
        outcomes.sort_by_key(|o| o.index);
        Ok(ExecutionReport {
            outcomes,
            statuses: state.statuses,
            elapsed_ms: tracker.elapsed_ms(),
            deadline_breached,
        })
    }

    async fn run_wave(
        &self,
        wave: Wave,
        mode: ExecutionMode,
        prefetch: &PrefetchCache,
        state: &mut BatchState,
    ) {
        let number = wave.number();
        let wave_tag = number.to_string();
        let tags = [("wave", wave_tag.as_str())];
        self.observer.increment(obs::WAVE_STARTED, &tags);
        obs::emit_wave_started(number, wave.len());

        let started = self.clock.now();
        let failed_before = state.failed();

        if mode == ExecutionMode::Sequential || wave.len() <= 1 {
            self.run_serial(wave, prefetch, state).await;
        } else {
            self.run_concurrent(wave, prefetch, state).await;
        }

        let duration_ms = self.clock.now().saturating_sub(started).as_millis() as u64;
        self.observer.increment(obs::WAVE_COMPLETED, &tags);
        self.observer
            .timing(obs::WAVE_DURATION_MS, duration_ms, &tags);
        obs::emit_wave_finished(number, duration_ms, state.failed() - failed_before);
    }

    async fn run_serial(&self, wave: Wave, prefetch: &PrefetchCache, state: &mut BatchState) {
        let runner = self.runner();
        let index = wave.index;
        for spec in wave.specs {
            let position = state.next_index();
            if let Some(dep) = failed_dependency(&spec, &state.statuses) {
                let (trace, result) = self.skip_for_dependency(&spec, &dep);
                state.record(spec.alias, index, position, trace, result);
                continue;
            }
            let (trace, result) = runner.clone().run(&spec, prefetch.clone()).await;
            state.record(spec.alias, index, position, trace, result);
        }
    }

    async fn run_concurrent(&self, wave: Wave, prefetch: &PrefetchCache, state: &mut BatchState) {
        let permits = wave.len().min(self.parallelism).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let runner = self.runner();
        let index = wave.index;

        let mut set = JoinSet::new();
        let mut pending: BTreeMap<String, (usize, NormalizedSpec)> = BTreeMap::new();

        for spec in wave.specs {
            let position = state.next_index();
            if let Some(dep) = failed_dependency(&spec, &state.statuses) {
                let (trace, result) = self.skip_for_dependency(&spec, &dep);
                state.record(spec.alias, index, position, trace, result);
                continue;
            }

            pending.insert(spec.alias.clone(), (position, spec.clone()));
            let semaphore = Arc::clone(&semaphore);
            let runner = runner.clone();
            let prefetch = prefetch.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let (trace, result) = runner.run(&spec, prefetch).await;
                (spec.alias, trace, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((alias, trace, result)) => {
                    if let Some((position, _)) = pending.remove(&alias) {
                        state.record(alias, index, position, trace, result);
                    }
                }
                Err(e) => warn!(wave = index + 1, error = %e, "wave worker task failed"),
            }
        }

        // A worker that died outside the agent call leaves its spec behind.
        for (alias, (position, spec)) in pending {
            let err = AgentError::internal("worker terminated unexpectedly");
            let (trace, result) = placeholder(&spec, &err.message, 0, false, 0, Some(&err));
            self.observer
                .increment(obs::CALL_FAILED, &[("intent", spec.intent.as_str())]);
            state.record(alias, index, position, trace, result);
        }
    }

    fn skip_for_dependency(
        &self,
        spec: &NormalizedSpec,
        dependency: &str,
    ) -> (ExecutionTrace, PartialResult) {
        let reason = format!("dependency {dependency} failed");
        self.observer
            .increment(obs::CALL_SKIPPED, &[("intent", spec.intent.as_str())]);
        obs::emit_call_skipped(&spec.alias, &reason);
        placeholder(spec, &reason, 0, false, 0, None)
    }

    /// Emit a failed placeholder for every spec of `waves`. Returns the
    /// number of skipped calls.
    fn skip_waves(
        &self,
        waves: impl Iterator<Item = Wave>,
        reason: &str,
        state: &mut BatchState,
    ) -> usize {
        let err = AgentError::new(ErrorKind::Timeout, reason);
        let mut count = 0;
        for wave in waves {
            let wave_tag = wave.number().to_string();
            self.observer
                .increment(obs::WAVE_SKIPPED, &[("wave", wave_tag.as_str())]);
            for spec in wave.specs {
                let position = state.next_index();
                self.observer
                    .increment(obs::CALL_SKIPPED, &[("intent", spec.intent.as_str())]);
                obs::emit_call_skipped(&spec.alias, reason);
                let (trace, result) = placeholder(&spec, reason, 0, false, 0, Some(&err));
                state.record(spec.alias, wave.index, position, trace, result);
                count += 1;
            }
        }
        count
    }
}

fn failed_dependency(spec: &NormalizedSpec, statuses: &AliasStatusMap) -> Option<String> {
    spec.depends_on
        .iter()
        .find(|dep| statuses.get(dep.as_str()) == Some(&false))
        .cloned()
}

#[derive(Default)]
struct BatchState {
    outcomes: Vec<CallOutcome>,
    statuses: AliasStatusMap,
    assigned: usize,
    recorded: HashSet<String>,
}

impl BatchState {
    fn next_index(&mut self) -> usize {
        let index = self.assigned;
        self.assigned += 1;
        index
    }

    fn failed(&self) -> usize {
        self.statuses.values().filter(|ok| !**ok).count()
    }

    fn record(
        &mut self,
        alias: String,
        wave: usize,
        index: usize,
        trace: ExecutionTrace,
        result: PartialResult,
    ) {
        if !self.recorded.insert(alias.clone()) {
            warn!(alias = %alias, "duplicate outcome ignored");
            return;
        }
        self.statuses.insert(alias.clone(), result.ok);
        self.outcomes.push(CallOutcome {
            alias,
            wave,
            trace,
            result,
            index,
        });
    }
}

/// Per-call attempt loop shared by serial and concurrent waves.
#[derive(Clone)]
struct CallRunner {
    retry: RetryPolicy,
    observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    backoff_ms: u64,
    timeout_ms: u64,
}

impl CallRunner {
    async fn run(
        self,
        spec: &NormalizedSpec,
        prefetch: PrefetchCache,
    ) -> (ExecutionTrace, PartialResult) {
        let tags = [
            ("intent", spec.intent.as_str()),
            ("agent", spec.agent_name()),
        ];
        let started = self.clock.now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.observer.increment(obs::ATTEMPT_STARTED, &tags);

            let agent = Arc::clone(&spec.agent);
            let method = spec.method.clone();
            let params = spec.params.clone();
            let cache = prefetch.clone();
            let outcome = tokio::task::spawn_blocking(move || agent.call(&method, &params, &cache))
                .await
                .unwrap_or_else(|e| Err(worker_error(e)));

            let elapsed_ms = self.clock.now().saturating_sub(started).as_millis() as u64;

            match outcome {
                Ok(report) => {
                    let (trace, result) =
                        from_report(spec, &report, attempt, elapsed_ms, self.timeout_ms);
                    self.observer
                        .timing(obs::CALL_DURATION_MS, elapsed_ms, &tags);
                    if result.ok {
                        self.observer.increment(obs::CALL_SUCCEEDED, &tags);
                    } else {
                        self.observer.increment(obs::CALL_SOFT_TIMEOUT, &tags);
                        self.observer.increment(obs::CALL_FAILED, &tags);
                        warn!(
                            alias = %spec.alias,
                            elapsed_ms,
                            limit_ms = self.timeout_ms,
                            "call exceeded per-agent timeout"
                        );
                    }
                    obs::emit_call_finished(&spec.alias, attempt, elapsed_ms, result.ok);
                    return (trace, result);
                }
                Err(err) => {
                    obs::emit_call_failed(&spec.alias, attempt, &err);
                    if attempt < self.max_attempts && self.retry.is_retryable(err.kind) {
                        self.observer.increment(obs::CALL_RETRIED, &tags);
                        let delay = self
                            .backoff_ms
                            .saturating_mul(2u64.saturating_pow(attempt - 1));
                        if delay > 0 {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                        continue;
                    }

                    self.observer
                        .timing(obs::CALL_DURATION_MS, elapsed_ms, &tags);
                    self.observer.increment(obs::CALL_FAILED, &tags);
                    obs::emit_call_finished(&spec.alias, attempt, elapsed_ms, false);
                    let warning = format!(
                        "call {} failed after {attempt} attempt(s): {err}",
                        spec.alias
                    );
                    return placeholder(spec, &warning, attempt, false, elapsed_ms, Some(&err));
                }
            }
        }
    }
}

/// Turn a failed blocking task into a per-call error.
fn worker_error(err: JoinError) -> AgentError {
    if !err.is_panic() {
        return AgentError::internal("agent worker was cancelled");
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => AgentError::new(ErrorKind::Panicked, format!("agent panicked: {detail}")),
        None => AgentError::new(ErrorKind::Panicked, "agent panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize_specs, CallSpec};
    use crate::params::Params;
    use crate::planner::plan;
    use crate::policy::{Complexity, PolicyConfig};
    use crate::registry::{Agent, InMemoryRegistry};
    use crate::report::{Finding, StructuredReport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        failures: usize,
        kind: ErrorKind,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(name: &'static str) -> Arc<Self> {
            Self::failing(name, 0, ErrorKind::Internal)
        }

        fn failing(name: &'static str, failures: usize, kind: ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures,
                kind,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Agent for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn call(
            &self,
            _method: &str,
            _params: &Params,
            _prefetch: &PrefetchCache,
        ) -> Result<StructuredReport, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(AgentError::new(self.kind, format!("failure {n}")));
            }
            Ok(StructuredReport::new(vec![Finding::new(self.name, "done")]))
        }
    }

    fn policy(retry_transient: u32) -> Policy {
        Policy::new(PolicyConfig {
            retry_transient,
            retry_backoff_ms: 0,
            ..Complexity::Medium.config()
        })
        .unwrap()
    }

    async fn execute(
        agents: Vec<(&'static str, Arc<Scripted>)>,
        specs: Vec<CallSpec>,
        mode: ExecutionMode,
        policy: Policy,
    ) -> ExecutionReport {
        let mut registry = InMemoryRegistry::new();
        for (intent, agent) in agents {
            registry.register(intent, agent, "run", vec![]).unwrap();
        }
        let normalized = normalize_specs(&registry, &specs).unwrap();
        let waves = plan("test", normalized, mode, policy.max_parallel()).unwrap();
        WaveExecutor::new(policy)
            .execute(waves, mode, &PrefetchCache::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let agent = Scripted::failing("flaky", 1, ErrorKind::Transient);
        let report = execute(
            vec![("flaky", Arc::clone(&agent))],
            vec![CallSpec::new("flaky")],
            ExecutionMode::Single,
            policy(1),
        )
        .await;
        assert!(report.outcomes[0].ok());
        assert_eq!(report.outcomes[0].trace.attempt, 2);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_not_retried() {
        let agent = Scripted::failing("broken", 5, ErrorKind::InvalidInput);
        let report = execute(
            vec![("broken", Arc::clone(&agent))],
            vec![CallSpec::new("broken")],
            ExecutionMode::Single,
            policy(3),
        )
        .await;
        let outcome = &report.outcomes[0];
        assert!(!outcome.ok());
        assert_eq!(outcome.trace.attempt, 1);
        assert_eq!(
            outcome.trace.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::InvalidInput)
        );
        assert!(!report.statuses["broken"]);
    }

    #[tokio::test]
    async fn test_retries_exhausted_yields_failed_outcome() {
        let agent = Scripted::failing("flaky", 10, ErrorKind::Transient);
        let report = execute(
            vec![("flaky", Arc::clone(&agent))],
            vec![CallSpec::new("flaky")],
            ExecutionMode::Single,
            policy(2),
        )
        .await;
        assert!(!report.outcomes[0].ok());
        assert_eq!(report.outcomes[0].trace.attempt, 3);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_wave_isolates_failures_and_keeps_plan_order() {
        let report = execute(
            vec![
                ("a", Scripted::ok("a")),
                ("b", Scripted::failing("b", 9, ErrorKind::Internal)),
                ("c", Scripted::ok("c")),
            ],
            vec![CallSpec::new("a"), CallSpec::new("b"), CallSpec::new("c")],
            ExecutionMode::Parallel,
            policy(0),
        )
        .await;
        let aliases: Vec<&str> = report.outcomes.iter().map(|o| o.alias.as_str()).collect();
        assert_eq!(aliases, vec!["a", "b", "c"]);
        let oks: Vec<bool> = report.outcomes.iter().map(CallOutcome::ok).collect();
        assert_eq!(oks, vec![true, false, true]);
        assert!(!report.deadline_breached);
    }

    #[test]
    fn test_worker_error_keeps_panic_message() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = rt.block_on(async {
            tokio::task::spawn_blocking(|| panic!("bad state"))
                .await
                .unwrap_err()
        });
        let agent_err = worker_error(err);
        assert_eq!(agent_err.kind, ErrorKind::Panicked);
        assert!(agent_err.message.contains("bad state"));
    }
}
