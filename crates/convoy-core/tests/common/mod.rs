//! Shared fixtures for convoy-core integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use convoy_core::{
    Agent, AgentError, Evidence, Finding, InMemoryRegistry, ManualClock, ParamSpec, Params,
    PolicyConfig, PrefetchCache, StructuredReport,
};

/// What a [`TestAgent`] does when called.
#[derive(Clone)]
pub enum Behavior {
    Report(StructuredReport),
    Fail(AgentError),
    Panic(&'static str),
    /// Fail `failures` times with `error`, then return `report`.
    Flaky {
        failures: usize,
        error: AgentError,
        report: StructuredReport,
    },
}

/// Scripted agent that can move a manual clock while it "works".
pub struct TestAgent {
    name: String,
    behavior: Behavior,
    clock: Option<Arc<ManualClock>>,
    advance_ms: u64,
    calls: AtomicUsize,
}

impl TestAgent {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            clock: None,
            advance_ms: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn reporting(name: &str) -> Self {
        Self::new(name, Behavior::Report(report_for(name)))
    }

    pub fn failing(name: &str, error: AgentError) -> Self {
        Self::new(name, Behavior::Fail(error))
    }

    /// Advance `clock` by `ms` on every call.
    pub fn taking(mut self, clock: &Arc<ManualClock>, ms: u64) -> Self {
        self.clock = Some(Arc::clone(clock));
        self.advance_ms = ms;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Agent for TestAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        _method: &str,
        _params: &Params,
        _prefetch: &PrefetchCache,
    ) -> Result<StructuredReport, AgentError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(clock) = &self.clock {
            clock.advance_ms(self.advance_ms);
        }
        match &self.behavior {
            Behavior::Report(report) => Ok(report.clone()),
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::Panic(msg) => panic!("{msg}"),
            Behavior::Flaky {
                failures,
                error,
                report,
            } => {
                if n < *failures {
                    Err(error.clone())
                } else {
                    Ok(report.clone())
                }
            }
        }
    }
}

/// A report with one finding backed by one piece of evidence on `ds_<name>`.
pub fn report_for(name: &str) -> StructuredReport {
    StructuredReport::new(vec![Finding::new(
        format!("{name} outlook"),
        "stable across regions",
    )
    .with_metric("score", serde_json::json!(0.8))
    .with_evidence(
        Evidence::new(format!("q_{name}"), format!("ds_{name}"))
            .with_description("daily aggregates")
            .with_freshness("2024-01-02T00:00:00Z", Some(1.0)),
    )])
}

/// Register every `(intent, agent)` pair under method `run` with no params.
pub fn registry(agents: Vec<(&str, Arc<TestAgent>)>) -> InMemoryRegistry {
    let mut registry = InMemoryRegistry::new();
    for (intent, agent) in agents {
        registry
            .register(intent, agent, "run", Vec::<ParamSpec>::new())
            .unwrap();
    }
    registry
}

/// Smallest valid budgets with no retry backoff.
pub fn tight_policy(max_parallel: usize) -> PolicyConfig {
    PolicyConfig {
        max_parallel,
        crisis_parallel: max_parallel,
        per_agent_timeout_ms: 1000,
        total_timeout_ms: 1000,
        retry_transient: 0,
        retry_backoff_ms: 0,
        strict_merge: false,
    }
}
