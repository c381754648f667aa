//! Support code for the `convoy` binary.
//!
//! The CLI drives the full pipeline from JSON files. Agents are fixtures
//! declared in a registry manifest: each returns a canned report or a canned
//! error, optionally after a delay.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use convoy_core::{
    merge_results, preview, select_policy, Agent, AgentError, BatchReport, BatchRequest,
    Complexity, Coordinator, FanoutObserver, InMemoryRegistry, MergedResult, MetricsObserver,
    Observer, ParamSpec, Params, PartialResult, Policy, PolicyConfig, PrefetchCache,
    StructuredReport, TracingObserver,
};

/// Canned behavior of a fixture agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    /// Returned on success. Defaults to an empty report.
    #[serde(default)]
    pub report: Option<StructuredReport>,
    /// When set, every call fails with this error.
    #[serde(default)]
    pub error: Option<AgentError>,
    /// Blocking delay before answering.
    #[serde(default)]
    pub delay_ms: u64,
}

/// One registered intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub intent: String,
    pub agent: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub fixture: Fixture,
}

/// Registry manifest file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryManifest {
    pub agents: Vec<AgentEntry>,
}

/// Agent that replays a [`Fixture`].
#[derive(Debug)]
pub struct FixtureAgent {
    name: String,
    fixture: Fixture,
}

impl FixtureAgent {
    pub fn new(name: impl Into<String>, fixture: Fixture) -> Self {
        Self {
            name: name.into(),
            fixture,
        }
    }
}

impl Agent for FixtureAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        method: &str,
        params: &Params,
        _prefetch: &PrefetchCache,
    ) -> Result<StructuredReport, AgentError> {
        debug!(agent = %self.name, method = %method, params = params.len(), "fixture call");
        if self.fixture.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.fixture.delay_ms));
        }
        match &self.fixture.error {
            Some(error) => Err(error.clone()),
            None => Ok(self.fixture.report.clone().unwrap_or_default()),
        }
    }
}

impl RegistryManifest {
    /// Build an in-memory registry of fixture agents.
    pub fn into_registry(self) -> Result<InMemoryRegistry> {
        let mut registry = InMemoryRegistry::new();
        for entry in self.agents {
            let agent = Arc::new(FixtureAgent::new(entry.agent, entry.fixture));
            registry
                .register(entry.intent, agent, entry.method, entry.params)
                .context("invalid registry manifest")?;
        }
        Ok(registry)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {what}: {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("{what} is not valid JSON: {:?}", path))
}

pub fn load_registry(path: &Path) -> Result<InMemoryRegistry> {
    read_json::<RegistryManifest>(path, "registry manifest")?.into_registry()
}

pub fn load_batch(path: &Path) -> Result<BatchRequest> {
    read_json(path, "batch request")
}

/// A merge input file holds one partial result or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum PartialFile {
    One(Box<PartialResult>),
    Many(Vec<PartialResult>),
}

pub fn load_partials(paths: &[PathBuf]) -> Result<Vec<PartialResult>> {
    let mut results = Vec::new();
    for path in paths {
        match read_json::<PartialFile>(path, "partial result")? {
            PartialFile::One(result) => results.push(*result),
            PartialFile::Many(many) => results.extend(many),
        }
    }
    Ok(results)
}

/// Canned policy for `complexity`, or `CONVOY_*` environment overrides on
/// top of the medium policy when no label is given.
pub fn resolve_policy(complexity: Option<&str>) -> Result<Policy> {
    match complexity {
        Some(label) => {
            let complexity: Complexity = label.parse()?;
            Ok(select_policy(complexity))
        }
        None => {
            let config =
                PolicyConfig::from_env().context("Failed to read policy from environment")?;
            Ok(Policy::new(config)?)
        }
    }
}

/// `convoy policy`
pub fn policy_json(complexity: &str) -> Result<serde_json::Value> {
    let policy = resolve_policy(Some(complexity))?;
    Ok(serde_json::to_value(policy.to_config())?)
}

/// `convoy plan`
pub fn plan_json(
    registry: &Path,
    batch: &Path,
    complexity: Option<&str>,
) -> Result<serde_json::Value> {
    let coordinator = build_coordinator(registry, complexity)?;
    let request = load_batch(batch)?;
    let planned = preview(&coordinator, &request)?;

    let waves: Vec<serde_json::Value> = planned
        .waves
        .iter()
        .map(|wave| {
            serde_json::json!({
                "wave": wave.number(),
                "calls": wave.specs.iter().map(|s| serde_json::json!({
                    "alias": s.alias,
                    "intent": s.intent,
                    "method": s.qualified_method(),
                    "depends_on": s.depends_on,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(serde_json::json!({
        "mode": planned.mode,
        "parallelism": planned.parallelism,
        "fingerprint": planned.fingerprint,
        "waves": waves,
    }))
}

fn build_coordinator(registry: &Path, complexity: Option<&str>) -> Result<Coordinator> {
    Ok(Coordinator::new(
        Arc::new(load_registry(registry)?),
        resolve_policy(complexity)?,
    ))
}

/// Hook calls always feed the global metrics; `verbose` also traces each one.
pub fn observer_for(verbose: bool) -> Arc<dyn Observer> {
    let fanout = FanoutObserver::new().with(Arc::new(MetricsObserver::default()));
    if verbose {
        Arc::new(fanout.with(Arc::new(TracingObserver)))
    } else {
        Arc::new(fanout)
    }
}

/// `convoy run`
pub async fn run_batch(
    registry: &Path,
    batch: &Path,
    complexity: Option<&str>,
    verbose: bool,
) -> Result<BatchReport> {
    let coordinator =
        build_coordinator(registry, complexity)?.with_observer(observer_for(verbose));
    let request = load_batch(batch)?;
    Ok(coordinator.run(request).await?)
}

/// `convoy merge`
pub fn merge_files(paths: &[PathBuf]) -> Result<MergedResult> {
    let partials = load_partials(paths)?;
    Ok(merge_results(&partials)?)
}
