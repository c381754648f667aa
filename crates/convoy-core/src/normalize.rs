//! Call declarations and their validation against the registry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ConvoyError, ConvoyResult, DependencyViolation, ParamViolation};
use crate::params::{ParamSpec, ParamValue, Params};
use crate::registry::{Agent, AgentRegistry};

/// A caller-supplied call declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    pub intent: String,
    /// Declared method. When absent the registry's canonical method is used.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Params,
    /// Unique label within the batch. Defaults to `intent`.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

impl CallSpec {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            method: None,
            params: Params::new(),
            alias: None,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, alias: impl Into<String>) -> Self {
        self.depends_on.insert(alias.into());
        self
    }
}

/// A resolved, validated, immutable call.
#[derive(Clone)]
pub struct NormalizedSpec {
    pub alias: String,
    pub intent: String,
    pub method: String,
    pub agent: Arc<dyn Agent>,
    pub params: Params,
    pub depends_on: BTreeSet<String>,
}

impl NormalizedSpec {
    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    /// `"<agent>.<method>"`
    pub fn qualified_method(&self) -> String {
        format!("{}.{}", self.agent.name(), self.method)
    }
}

impl fmt::Debug for NormalizedSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedSpec")
            .field("alias", &self.alias)
            .field("intent", &self.intent)
            .field("method", &self.method)
            .field("agent", &self.agent.name())
            .field("params", &self.params)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Resolve, canonicalize and validate a batch of call declarations.
///
/// Fails the whole batch on an unknown intent, a declared method that
/// disagrees with the registry, a duplicate alias, parameters that do not
/// fit the method signature, or a broken `depends_on` graph. Parameter and
/// dependency problems are reported all at once.
pub fn normalize_specs(
    registry: &dyn AgentRegistry,
    specs: &[CallSpec],
) -> ConvoyResult<Vec<NormalizedSpec>> {
    let mut seen = HashSet::new();
    let mut param_violations = Vec::new();
    let mut normalized = Vec::with_capacity(specs.len());

    for spec in specs {
        let resolution = registry.resolve(&spec.intent)?;

        if let Some(declared) = &spec.method {
            if declared != &resolution.method {
                return Err(ConvoyError::MethodMismatch {
                    intent: spec.intent.clone(),
                    declared: declared.clone(),
                    canonical: resolution.method,
                });
            }
        }

        let alias = spec
            .alias
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| spec.intent.clone());
        if !seen.insert(alias.clone()) {
            return Err(ConvoyError::DuplicateAlias { alias });
        }

        param_violations.extend(check_params(&alias, &spec.params, &resolution.params));

        debug!(
            alias = %alias,
            intent = %spec.intent,
            method = %resolution.method,
            "normalized call spec"
        );
        normalized.push(NormalizedSpec {
            alias,
            intent: spec.intent.clone(),
            method: resolution.method,
            agent: resolution.agent,
            params: spec.params.clone(),
            depends_on: spec.depends_on.clone(),
        });
    }

    if !param_violations.is_empty() {
        return Err(ConvoyError::InvalidParams {
            violations: param_violations,
        });
    }

    validate_dependencies(&normalized)?;
    Ok(normalized)
}

fn check_params(alias: &str, params: &Params, declared: &[ParamSpec]) -> Vec<ParamViolation> {
    let mut violations = Vec::new();

    for (name, value) in params {
        match declared.iter().find(|p| &p.name == name) {
            None => violations.push(ParamViolation::Unsupported {
                alias: alias.to_string(),
                param: name.clone(),
            }),
            Some(spec) if !spec.kind.accepts(value.kind()) => {
                violations.push(ParamViolation::WrongType {
                    alias: alias.to_string(),
                    param: name.clone(),
                    expected: spec.kind.to_string(),
                    actual: value.kind().to_string(),
                })
            }
            Some(_) => {}
        }
    }

    for spec in declared.iter().filter(|p| p.required) {
        if !params.contains_key(&spec.name) {
            violations.push(ParamViolation::Missing {
                alias: alias.to_string(),
                param: spec.name.clone(),
            });
        }
    }

    violations
}

/// Check every `depends_on` edge of the batch at once.
pub fn validate_dependencies(specs: &[NormalizedSpec]) -> ConvoyResult<()> {
    let aliases: HashSet<&str> = specs.iter().map(|s| s.alias.as_str()).collect();
    let mut violations = Vec::new();

    for spec in specs {
        for target in &spec.depends_on {
            if target == &spec.alias {
                violations.push(DependencyViolation::SelfDependency {
                    alias: spec.alias.clone(),
                });
            } else if !aliases.contains(target.as_str()) {
                violations.push(DependencyViolation::UnknownTarget {
                    alias: spec.alias.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    if let Some(path) = find_cycle(specs, &aliases) {
        violations.push(DependencyViolation::Cycle { path });
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConvoyError::InvalidDependencies { violations })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// First cycle found by depth-first search in batch order. Self edges and
/// unknown targets are reported separately and skipped here.
fn find_cycle(specs: &[NormalizedSpec], aliases: &HashSet<&str>) -> Option<Vec<String>> {
    let edges: HashMap<&str, Vec<&str>> = specs
        .iter()
        .map(|spec| {
            let targets = spec
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|t| *t != spec.alias && aliases.contains(t))
                .collect();
            (spec.alias.as_str(), targets)
        })
        .collect();

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    specs.iter().find_map(|spec| {
        if marks.contains_key(spec.alias.as_str()) {
            return None;
        }
        visit(spec.alias.as_str(), &edges, &mut marks, &mut stack)
    })
}

fn visit<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(node, Mark::Visiting);
    stack.push(node);
    for &next in edges.get(node).into_iter().flatten() {
        match marks.get(next) {
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == next)?;
                let mut path: Vec<String> =
                    stack[start..].iter().map(|n| n.to_string()).collect();
                path.push(next.to_string());
                return Some(path);
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(path) = visit(next, edges, marks, stack) {
                    return Some(path);
                }
            }
        }
    }
    stack.pop();
    marks.insert(node, Mark::Done);
    None
}

/// Deterministic SHA-256 fingerprint of a normalized batch.
///
/// Covers alias, intent, method, params and dependencies of every spec in
/// order, so two requests with the same calls share a fingerprint.
pub fn batch_fingerprint(specs: &[NormalizedSpec]) -> String {
    let mut hasher = Sha256::new();
    for spec in specs {
        hasher.update(spec.alias.as_bytes());
        hasher.update(b"\0");
        hasher.update(spec.intent.as_bytes());
        hasher.update(b"\0");
        hasher.update(spec.qualified_method().as_bytes());
        hasher.update(b"\0");
        for (key, value) in &spec.params {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            // BTreeMap keeps keys ordered; serde_json output is stable per value.
            hasher.update(serde_json::to_string(value).unwrap_or_default().as_bytes());
            hasher.update(b"\0");
        }
        for dep in &spec.depends_on {
            hasher.update(b">");
            hasher.update(dep.as_bytes());
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
