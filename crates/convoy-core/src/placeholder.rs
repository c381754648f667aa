//! Builds the trace and partial result for every call, whether it ran,
//! failed or was skipped.

use std::collections::BTreeMap;

use crate::error::AgentError;
use crate::merge::fold_freshness;
use crate::normalize::NormalizedSpec;
use crate::report::{Finding, StructuredReport};
use crate::result::{
    Citation, ExecutionTrace, Freshness, PartialResult, Reproducibility, Section, TraceError,
    EVIDENCE, EXECUTIVE_SUMMARY, KEY_FINDINGS, WARNINGS,
};

/// Warning attached to a call that ran longer than the per-agent limit.
pub const SOFT_TIMEOUT_WARNING: &str = "exceeded per-agent timeout";

/// Number of findings promoted into the executive summary.
const SUMMARY_FINDINGS: usize = 3;

/// Synthesize the trace and result skeleton for a call that produced no
/// report.
///
/// The skeleton has a single "Warnings" section when `warning` is non-empty
/// and no citations or freshness.
pub fn placeholder(
    spec: &NormalizedSpec,
    warning: &str,
    attempt: u32,
    success: bool,
    elapsed_ms: u64,
    error: Option<&AgentError>,
) -> (ExecutionTrace, PartialResult) {
    let warnings: Vec<String> = if warning.is_empty() {
        Vec::new()
    } else {
        vec![warning.to_string()]
    };
    let sections = if warning.is_empty() {
        Vec::new()
    } else {
        vec![Section::new(WARNINGS, warning)]
    };

    let trace = ExecutionTrace {
        intent: spec.intent.clone(),
        agent_name: spec.agent_name().to_string(),
        method: spec.method.clone(),
        elapsed_ms,
        attempt,
        success,
        warnings: warnings.clone(),
        error: error.map(TraceError::from),
    };
    let result = PartialResult {
        ok: success,
        intent: spec.intent.clone(),
        sections,
        citations: Vec::new(),
        freshness: BTreeMap::new(),
        reproducibility: vec![reproducibility(spec)],
        combined_reproducibility: None,
        warnings,
        traces: vec![trace.clone()],
    };
    (trace, result)
}

/// Build the trace and result for a call that returned a report.
///
/// A call slower than `timeout_ms` keeps its data but is marked not ok and
/// carries [`SOFT_TIMEOUT_WARNING`].
pub fn from_report(
    spec: &NormalizedSpec,
    report: &StructuredReport,
    attempt: u32,
    elapsed_ms: u64,
    timeout_ms: u64,
) -> (ExecutionTrace, PartialResult) {
    let soft_timeout = elapsed_ms > timeout_ms;

    let mut warnings: Vec<String> = report
        .warnings
        .iter()
        .map(|w| w.trim().to_string())
        .filter(|w| !w.is_empty())
        .collect();
    if soft_timeout {
        warnings.push(format!(
            "{SOFT_TIMEOUT_WARNING} ({elapsed_ms} ms > {timeout_ms} ms)"
        ));
    }

    let mut sections = Vec::new();
    if !report.findings.is_empty() {
        let summary = report
            .findings
            .iter()
            .take(SUMMARY_FINDINGS)
            .map(finding_line)
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(Section::new(EXECUTIVE_SUMMARY, summary));

        let key_findings = report
            .findings
            .iter()
            .map(|f| {
                let metrics = render_metrics(f);
                if metrics.is_empty() {
                    finding_line(f)
                } else {
                    format!("{} ({metrics})", finding_line(f))
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(Section::new(KEY_FINDINGS, key_findings));
    }

    let evidence: Vec<_> = report.findings.iter().flat_map(|f| &f.evidence).collect();
    if !evidence.is_empty() {
        let lines = evidence
            .iter()
            .map(|e| {
                if e.description.is_empty() {
                    format!("- [{}/{}]", e.dataset_id, e.query_id)
                } else {
                    format!("- [{}/{}] {}", e.dataset_id, e.query_id, e.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(Section::new(EVIDENCE, lines));
    }
    if !warnings.is_empty() {
        sections.push(Section::new(WARNINGS, warnings.join("\n")));
    }

    let citations = evidence
        .iter()
        .map(|e| Citation {
            query_id: e.query_id.clone(),
            dataset_id: e.dataset_id.clone(),
            description: e.description.clone(),
        })
        .collect();

    let mut observed: BTreeMap<&str, Vec<Freshness>> = BTreeMap::new();
    for e in &evidence {
        if let Some(last_updated) = &e.last_updated {
            let mut record = Freshness::new(e.dataset_id.clone(), last_updated.clone());
            record.age_days = e.age_days;
            observed.entry(e.dataset_id.as_str()).or_default().push(record);
        }
    }
    let freshness = observed
        .into_iter()
        .filter_map(|(source, records)| {
            fold_freshness(source, records.iter()).map(|f| (source.to_string(), f))
        })
        .collect();

    let ok = !soft_timeout;
    let trace = ExecutionTrace {
        intent: spec.intent.clone(),
        agent_name: spec.agent_name().to_string(),
        method: spec.method.clone(),
        elapsed_ms,
        attempt,
        success: ok,
        warnings: warnings.clone(),
        error: None,
    };
    let result = PartialResult {
        ok,
        intent: spec.intent.clone(),
        sections,
        citations,
        freshness,
        reproducibility: vec![reproducibility(spec)],
        combined_reproducibility: None,
        warnings,
        traces: vec![trace.clone()],
    };
    (trace, result)
}

fn reproducibility(spec: &NormalizedSpec) -> Reproducibility {
    Reproducibility::new(spec.qualified_method(), spec.params.clone())
}

fn finding_line(finding: &Finding) -> String {
    if finding.summary.is_empty() {
        format!("- {}", finding.title)
    } else {
        format!("- {}: {}", finding.title, finding.summary)
    }
}

fn render_metrics(finding: &Finding) -> String {
    finding
        .metrics
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::params::{ParamValue, Params};
    use crate::registry::{Agent, PrefetchCache};
    use crate::report::Evidence;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    struct Noop;

    impl Agent for Noop {
        fn name(&self) -> &str {
            "risk_agent"
        }

        fn call(
            &self,
            _method: &str,
            _params: &Params,
            _prefetch: &PrefetchCache,
        ) -> Result<StructuredReport, AgentError> {
            Ok(StructuredReport::default())
        }
    }

    fn spec() -> NormalizedSpec {
        NormalizedSpec {
            alias: "risk".to_string(),
            intent: "risk".to_string(),
            method: "assess".to_string(),
            agent: Arc::new(Noop),
            params: Params::from([("region".to_string(), ParamValue::from("emea"))]),
            depends_on: BTreeSet::new(),
        }
    }

    fn report() -> StructuredReport {
        let findings = (1..=4)
            .map(|i| {
                Finding::new(format!("finding {i}"), format!("summary {i}"))
                    .with_metric("score", serde_json::json!(i))
                    .with_evidence(
                        Evidence::new(format!("q{i}"), "ds1")
                            .with_description(format!("rows {i}"))
                            .with_freshness(format!("2024-01-0{i}T00:00:00Z"), Some(i as f64)),
                    )
            })
            .collect();
        StructuredReport::new(findings).with_warning("partial coverage")
    }

    #[test]
    fn test_placeholder_carries_warning_and_error() {
        let err = AgentError::internal("boom");
        let (trace, result) = placeholder(&spec(), "agent call failed", 2, false, 17, Some(&err));
        assert!(!result.ok);
        assert_eq!(result.sections, vec![Section::new(WARNINGS, "agent call failed")]);
        assert!(result.citations.is_empty());
        assert!(result.freshness.is_empty());
        assert_eq!(result.reproducibility.len(), 1);
        assert_eq!(result.reproducibility[0].method, "risk_agent.assess");
        assert_eq!(result.reproducibility[0].params, spec().params);
        assert_eq!(trace.attempt, 2);
        assert_eq!(trace.elapsed_ms, 17);
        assert_eq!(trace.error.as_ref().unwrap().kind, ErrorKind::Internal);
        assert_eq!(result.traces, vec![trace]);
    }

    #[test]
    fn test_placeholder_without_warning_has_no_sections() {
        let (_, result) = placeholder(&spec(), "", 1, true, 0, None);
        assert!(result.ok);
        assert!(result.sections.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_from_report_builds_sections_citations_and_freshness() {
        let (trace, result) = from_report(&spec(), &report(), 1, 10, 1000);
        assert!(result.ok);
        assert!(trace.success);

        let titles: Vec<&str> = result.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec![EXECUTIVE_SUMMARY, KEY_FINDINGS, EVIDENCE, WARNINGS]);
        assert_eq!(result.sections[0].body.lines().count(), 3);
        assert_eq!(result.sections[1].body.lines().count(), 4);
        assert!(result.sections[1].body.contains("- finding 2: summary 2 (score=2)"));
        assert!(result.sections[2].body.contains("- [ds1/q3] rows 3"));

        assert_eq!(result.citations.len(), 4);
        let ds1 = &result.freshness["ds1"];
        assert_eq!(ds1.last_updated, "2024-01-04T00:00:00Z");
        assert_eq!(ds1.age_days, Some(4.0));
        assert_eq!(ds1.min_last_updated.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(result.warnings, vec!["partial coverage".to_string()]);
    }

    #[test]
    fn test_slow_report_is_kept_but_not_ok() {
        let (trace, result) = from_report(&spec(), &report(), 1, 1500, 1000);
        assert!(!result.ok);
        assert!(!trace.success);
        assert_eq!(result.citations.len(), 4);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.starts_with(SOFT_TIMEOUT_WARNING)));
    }
}
