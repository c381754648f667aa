//! Structured output returned by an agent call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single piece of supporting data behind a finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub query_id: String,
    pub dataset_id: String,
    #[serde(default)]
    pub description: String,
    /// Raw timestamp of the dataset's last refresh, if the agent knows it.
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub age_days: Option<f64>,
}

impl Evidence {
    pub fn new(query_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            dataset_id: dataset_id.into(),
            description: String::new(),
            last_updated: None,
            age_days: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_freshness(
        mut self,
        last_updated: impl Into<String>,
        age_days: Option<f64>,
    ) -> Self {
        self.last_updated = Some(last_updated.into());
        self.age_days = age_days;
        self
    }
}

/// One conclusion reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

impl Finding {
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            summary: summary.into(),
            metrics: BTreeMap::new(),
            evidence: Vec::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }
}

/// Everything an agent returns from a successful call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredReport {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StructuredReport {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}
