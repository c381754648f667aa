//! End-to-end batch scenarios: merge ordering, deadline skips and
//! dependency failures.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{registry, tight_policy, TestAgent};
use convoy_core::{
    merge_results, AgentError, BatchRequest, CallSpec, Citation, Coordinator, ManualClock,
    PartialResult, Policy, Section,
};

fn partial(intent: &str, sections: Vec<Section>, citation: Citation) -> PartialResult {
    PartialResult {
        ok: true,
        intent: intent.to_string(),
        sections,
        citations: vec![citation],
        freshness: BTreeMap::new(),
        reproducibility: vec![],
        combined_reproducibility: None,
        warnings: vec![],
        traces: vec![],
    }
}

#[test]
fn scenario_a_sections_dedupe_and_order() {
    let findings = "Y: revenue is flat across all reported segments this quarter";
    let input1 = partial(
        "one",
        vec![
            Section::new("Executive Summary", "X: overall position is sound"),
            Section::new("Key Findings", findings),
        ],
        Citation::new("q1", "d1"),
    );
    let input2 = partial(
        "two",
        vec![
            Section::new("Evidence", "Z: ledger extracts for the period"),
            Section::new("Key Findings", findings),
        ],
        Citation::new("q2", "d2"),
    );

    let merged = merge_results(&[input2, input1]).unwrap();

    let titles: Vec<&str> = merged.sections.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["Executive Summary", "Key Findings", "Evidence"]);
    let datasets: Vec<&str> = merged
        .citations
        .iter()
        .map(|c| c.dataset_id.as_str())
        .collect();
    assert_eq!(datasets, vec!["d1", "d2"]);
    assert!(merged.ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_b_deadline_skips_second_wave() {
    let clock = Arc::new(ManualClock::new());
    let a = Arc::new(TestAgent::reporting("a").taking(&clock, 1001));
    let b = Arc::new(TestAgent::reporting("b").taking(&clock, 1001));
    let c = Arc::new(TestAgent::reporting("c"));
    let reg = registry(vec![
        ("a", Arc::clone(&a)),
        ("b", Arc::clone(&b)),
        ("c", Arc::clone(&c)),
    ]);
    let coordinator = Coordinator::new(Arc::new(reg), Policy::new(tight_policy(2)).unwrap())
        .with_clock(clock.clone());

    let request = BatchRequest::new(
        "parallel",
        vec![CallSpec::new("a"), CallSpec::new("b"), CallSpec::new("c")],
    );
    let report = coordinator.run(request).await.unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert!(report.deadline_breached);

    // Wave 1 ran: slow calls keep their data but are not ok.
    for outcome in &report.outcomes[..2] {
        assert_eq!(outcome.wave, 0);
        assert_eq!(outcome.trace.attempt, 1);
        assert!(!outcome.result.ok);
        assert_eq!(outcome.result.citations.len(), 1);
    }

    // Wave 2 never started.
    let skipped = &report.outcomes[2];
    assert_eq!(skipped.alias, "c");
    assert_eq!(skipped.wave, 1);
    assert!(!skipped.result.ok);
    assert_eq!(skipped.trace.attempt, 0);
    assert!(skipped.result.warnings[0].contains("timeout"));
    assert_eq!(c.calls(), 0);

    assert!(!report.merged.ok);
    assert!(report
        .merged
        .warnings
        .iter()
        .any(|w| w.contains("timeout breached after wave 1")));
}

#[tokio::test]
async fn scenario_c_failed_dependency_skips_dependent() {
    let a = Arc::new(TestAgent::failing("a", AgentError::internal("ledger offline")));
    let b = Arc::new(TestAgent::reporting("b"));
    let reg = registry(vec![("a", Arc::clone(&a)), ("b", Arc::clone(&b))]);
    let coordinator = Coordinator::new(Arc::new(reg), Policy::new(tight_policy(2)).unwrap());

    let request = BatchRequest::new(
        "sequential",
        vec![
            CallSpec::new("a").with_alias("a"),
            CallSpec::new("b").with_alias("b").depends_on("a"),
        ],
    );
    let report = coordinator.run(request).await.unwrap();

    let a_outcome = &report.outcomes[0];
    assert!(!a_outcome.result.ok);
    assert!(a_outcome.trace.error.is_some());

    let b_outcome = &report.outcomes[1];
    assert!(!b_outcome.result.ok);
    assert_eq!(b.calls(), 0);
    assert!(b_outcome.result.warnings[0].contains("dependency a failed"));
    assert!(!report.statuses["b"]);
    assert!(!report.merged.ok);
}
