//! Result records produced per call and by the merge engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ErrorKind};
use crate::params::Params;

/// Canonical section titles.
pub const EXECUTIVE_SUMMARY: &str = "Executive Summary";
pub const KEY_FINDINGS: &str = "Key Findings";
pub const EVIDENCE: &str = "Evidence";
pub const CITATIONS_AND_FRESHNESS: &str = "Citations & Freshness";
pub const REPRODUCIBILITY: &str = "Reproducibility";
pub const WARNINGS: &str = "Warnings";

/// A titled block of narrative text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub body: String,
}

impl Section {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Pointer to the query and dataset a statement is based on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub query_id: String,
    pub dataset_id: String,
    #[serde(default)]
    pub description: String,
}

impl Citation {
    pub fn new(query_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            dataset_id: dataset_id.into(),
            description: String::new(),
        }
    }
}

/// Observed data freshness for one source.
///
/// Timestamps stay as the raw strings agents reported; the merge engine
/// parses them when it needs to compare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Freshness {
    pub source: String,
    pub last_updated: String,
    #[serde(default)]
    pub age_days: Option<f64>,
    #[serde(default)]
    pub min_last_updated: Option<String>,
    #[serde(default)]
    pub max_last_updated: Option<String>,
}

impl Freshness {
    pub fn new(source: impl Into<String>, last_updated: impl Into<String>) -> Self {
        let last_updated = last_updated.into();
        Self {
            source: source.into(),
            min_last_updated: Some(last_updated.clone()),
            max_last_updated: Some(last_updated.clone()),
            last_updated,
            age_days: None,
        }
    }

    pub fn with_age_days(mut self, age_days: f64) -> Self {
        self.age_days = Some(age_days);
        self
    }
}

/// What was called, with which parameters, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reproducibility {
    /// `"<agent>.<method>"`, or a comma-joined list for combined records.
    pub method: String,
    #[serde(default)]
    pub params: Params,
    pub timestamp: DateTime<Utc>,
}

impl Reproducibility {
    pub fn new(method: impl Into<String>, params: Params) -> Self {
        Self {
            method: method.into(),
            params,
            timestamp: Utc::now(),
        }
    }
}

/// Error details recorded on a failed trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AgentError> for TraceError {
    fn from(err: &AgentError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

/// Execution record for one executed or skipped call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub intent: String,
    pub agent_name: String,
    pub method: String,
    pub elapsed_ms: u64,
    pub attempt: u32,
    pub success: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<TraceError>,
}

/// Output of one call, or the merged fold of many.
///
/// A partial result carries exactly one `reproducibility` entry and no
/// `combined_reproducibility`; a merged result carries the deduplicated
/// history of its inputs plus one synthesized combined record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub ok: bool,
    pub intent: String,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub freshness: BTreeMap<String, Freshness>,
    #[serde(default)]
    pub reproducibility: Vec<Reproducibility>,
    #[serde(default)]
    pub combined_reproducibility: Option<Reproducibility>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub traces: Vec<ExecutionTrace>,
}

/// The merged result has the same shape as its inputs.
pub type MergedResult = PartialResult;

impl PartialResult {
    /// Whether a section whose normalized title contains `title` exists.
    pub fn has_section(&self, title: &str) -> bool {
        let needle = title.trim().to_lowercase();
        self.sections
            .iter()
            .any(|s| s.title.trim().to_lowercase().contains(&needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_result_deserializes_with_defaults() {
        let json = r#"{"ok": true, "intent": "credit"}"#;
        let result: PartialResult = serde_json::from_str(json).unwrap();
        assert!(result.ok);
        assert!(result.sections.is_empty());
        assert!(result.combined_reproducibility.is_none());
    }

    #[test]
    fn test_has_section_matches_normalized_substring() {
        let result = PartialResult {
            ok: true,
            intent: "x".to_string(),
            sections: vec![Section::new("  Key Findings (Credit)", "body")],
            citations: vec![],
            freshness: BTreeMap::new(),
            reproducibility: vec![],
            combined_reproducibility: None,
            warnings: vec![],
            traces: vec![],
        };
        assert!(result.has_section(KEY_FINDINGS));
        assert!(!result.has_section(EXECUTIVE_SUMMARY));
    }
}
