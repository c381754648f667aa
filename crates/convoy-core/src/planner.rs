//! Wave planning: turns a normalized batch into ordered waves.
//!
//! A wave is a group of calls that may run concurrently. Waves run strictly
//! one after another.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConvoyError, ConvoyResult};
use crate::normalize::NormalizedSpec;

/// Declared topology of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Exactly one call.
    Single,
    /// Bounded-parallel chunks in input order.
    Parallel,
    /// One call per wave, dependencies must point backwards.
    Sequential,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Single => "single",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Sequential => "sequential",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ConvoyError;

    fn from_str(s: &str) -> ConvoyResult<Self> {
        match s {
            "single" => Ok(ExecutionMode::Single),
            "parallel" => Ok(ExecutionMode::Parallel),
            "sequential" => Ok(ExecutionMode::Sequential),
            other => Err(ConvoyError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calls meant to run together.
#[derive(Debug, Clone)]
pub struct Wave {
    /// 0-indexed position in the plan.
    pub index: usize,
    pub specs: Vec<NormalizedSpec>,
}

impl Wave {
    /// 1-based number used in user-facing messages.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn aliases(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.alias.as_str()).collect()
    }
}

/// Split `specs` into waves for `mode`.
///
/// `max_parallel` bounds the size of every parallel wave. Flattening the
/// returned waves always yields `specs` in input order.
pub fn plan(
    route: &str,
    specs: Vec<NormalizedSpec>,
    mode: ExecutionMode,
    max_parallel: usize,
) -> ConvoyResult<Vec<Wave>> {
    if specs.is_empty() {
        return Err(ConvoyError::EmptyBatch);
    }

    let groups: Vec<Vec<NormalizedSpec>> = match mode {
        ExecutionMode::Single => {
            if specs.len() != 1 {
                return Err(ConvoyError::SingleModeArity { count: specs.len() });
            }
            vec![specs]
        }
        ExecutionMode::Parallel => {
            let chunk = max_parallel.max(1);
            let mut groups = Vec::with_capacity(specs.len().div_ceil(chunk));
            let mut current = Vec::with_capacity(chunk);
            for spec in specs {
                current.push(spec);
                if current.len() == chunk {
                    groups.push(std::mem::take(&mut current));
                }
            }
            if !current.is_empty() {
                groups.push(current);
            }
            groups
        }
        ExecutionMode::Sequential => specs.into_iter().map(|s| vec![s]).collect(),
    };

    // Calls inside one wave are unordered, so every dependency must have
    // finished in an earlier wave.
    let mut earlier: HashSet<&str> = HashSet::new();
    for group in &groups {
        for spec in group {
            let pending = spec.depends_on.iter().find(|d| !earlier.contains(d.as_str()));
            if let Some(target) = pending {
                return Err(ConvoyError::ForwardDependency {
                    alias: spec.alias.clone(),
                    target: target.clone(),
                });
            }
        }
        earlier.extend(group.iter().map(|s| s.alias.as_str()));
    }

    let waves: Vec<Wave> = groups
        .into_iter()
        .enumerate()
        .map(|(index, specs)| Wave { index, specs })
        .collect();

    debug!(
        route = %route,
        mode = %mode,
        waves = waves.len(),
        sizes = ?waves.iter().map(Wave::len).collect::<Vec<_>>(),
        "planned batch"
    );
    Ok(waves)
}
