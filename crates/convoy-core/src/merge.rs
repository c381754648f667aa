//! Deterministic fold of partial results into one merged result.
//!
//! Input order carries no meaning: every list in the output is either
//! sorted by a fixed key or deduplicated in first-seen order, so the same
//! set of partial results always folds to the same content.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::debug;

use crate::error::{ConvoyError, ConvoyResult};
use crate::params::Params;
use crate::redact::redact;
use crate::result::{
    Citation, ExecutionTrace, Freshness, MergedResult, PartialResult, Reproducibility, Section,
    CITATIONS_AND_FRESHNESS, EVIDENCE, EXECUTIVE_SUMMARY, KEY_FINDINGS, REPRODUCIBILITY, WARNINGS,
};

/// Section order of a merged result. Titles are matched by substring on the
/// trimmed, lower-cased title; anything else sorts last.
pub const SECTION_PRIORITY: [&str; 6] = [
    EXECUTIVE_SUMMARY,
    KEY_FINDINGS,
    EVIDENCE,
    CITATIONS_AND_FRESHNESS,
    REPRODUCIBILITY,
    WARNINGS,
];

/// Body prefix length that participates in section deduplication.
const SECTION_KEY_CHARS: usize = 40;

/// Fold `results` into one merged result.
pub fn merge_results(results: &[PartialResult]) -> ConvoyResult<MergedResult> {
    if results.is_empty() {
        return Err(ConvoyError::EmptyMerge);
    }

    let reproducibility = merge_reproducibility(results);
    let combined = combined_reproducibility(&reproducibility);

    let merged = MergedResult {
        ok: results.iter().all(|r| r.ok),
        intent: merge_intents(results),
        sections: merge_sections(results),
        citations: merge_citations(results),
        freshness: merge_freshness(results),
        reproducibility,
        combined_reproducibility: Some(combined),
        warnings: merge_warnings(results),
        traces: merge_traces(results),
    };

    debug!(
        inputs = results.len(),
        ok = merged.ok,
        sections = merged.sections.len(),
        citations = merged.citations.len(),
        warnings = merged.warnings.len(),
        traces = merged.traces.len(),
        "merged partial results"
    );
    Ok(merged)
}

fn merge_intents(results: &[PartialResult]) -> String {
    let intents: BTreeSet<&str> = results
        .iter()
        .flat_map(|r| r.intent.split(','))
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .collect();
    intents.into_iter().collect::<Vec<_>>().join(",")
}

fn section_key(section: &Section) -> (String, String) {
    (
        section.title.trim().to_lowercase(),
        section.body.chars().take(SECTION_KEY_CHARS).collect(),
    )
}

/// Index of the first priority title contained in `title`.
pub fn section_rank(title: &str) -> usize {
    let normalized = title.trim().to_lowercase();
    SECTION_PRIORITY
        .iter()
        .position(|p| normalized.contains(&p.to_lowercase()))
        .unwrap_or(SECTION_PRIORITY.len())
}

fn merge_sections(results: &[PartialResult]) -> Vec<Section> {
    let mut seen = HashSet::new();
    let mut sections: Vec<Section> = results
        .iter()
        .flat_map(|r| r.sections.iter())
        .filter(|s| seen.insert(section_key(s)))
        .cloned()
        .collect();

    sections.sort_by_key(|s| section_rank(&s.title));
    for section in &mut sections {
        section.body = redact(&section.body);
    }
    sections
}

fn merge_citations(results: &[PartialResult]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let mut citations: Vec<Citation> = results
        .iter()
        .flat_map(|r| r.citations.iter())
        .filter(|c| seen.insert((c.query_id.clone(), c.dataset_id.clone())))
        .cloned()
        .collect();
    citations.sort_by(|a, b| {
        a.dataset_id
            .cmp(&b.dataset_id)
            .then_with(|| a.query_id.cmp(&b.query_id))
    });
    citations
}

fn merge_freshness(results: &[PartialResult]) -> BTreeMap<String, Freshness> {
    let mut by_source: BTreeMap<&str, Vec<&Freshness>> = BTreeMap::new();
    for (source, record) in results.iter().flat_map(|r| r.freshness.iter()) {
        by_source.entry(source.as_str()).or_default().push(record);
    }
    by_source
        .into_iter()
        .filter_map(|(source, records)| {
            fold_freshness(source, records).map(|f| (source.to_string(), f))
        })
        .collect()
}

fn merge_reproducibility(results: &[PartialResult]) -> Vec<Reproducibility> {
    let mut seen = HashSet::new();
    let mut records: Vec<Reproducibility> = results
        .iter()
        .flat_map(|r| r.reproducibility.iter())
        .filter(|rep| seen.insert((rep.method.clone(), rep.timestamp)))
        .cloned()
        .collect();
    records.sort_by_key(|rep| rep.timestamp);
    records
}

fn combined_reproducibility(records: &[Reproducibility]) -> Reproducibility {
    let methods: BTreeSet<&str> = records
        .iter()
        .flat_map(|rep| rep.method.split(','))
        .filter(|m| !m.is_empty())
        .collect();
    Reproducibility {
        method: methods.into_iter().collect::<Vec<_>>().join(","),
        params: Params::new(),
        timestamp: Utc::now(),
    }
}

fn merge_warnings(results: &[PartialResult]) -> Vec<String> {
    let mut seen = HashSet::new();
    results
        .iter()
        .flat_map(|r| r.warnings.iter())
        .map(|w| redact(w.trim()))
        .filter(|w| !w.is_empty())
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn merge_traces(results: &[PartialResult]) -> Vec<ExecutionTrace> {
    let mut seen = HashSet::new();
    let mut traces: Vec<ExecutionTrace> = results
        .iter()
        .flat_map(|r| r.traces.iter())
        .filter(|t| {
            seen.insert((
                t.intent.clone(),
                t.agent_name.clone(),
                t.method.clone(),
                t.attempt,
            ))
        })
        .cloned()
        .collect();
    traces.sort_by(|a, b| {
        a.intent
            .cmp(&b.intent)
            .then_with(|| a.method.cmp(&b.method))
            .then_with(|| a.attempt.cmp(&b.attempt))
            .then_with(|| a.elapsed_ms.cmp(&b.elapsed_ms))
    });
    traces
}

/// Parse a freshness timestamp.
///
/// Accepts RFC 3339, then naive `T`- or space-separated datetimes with an
/// optional trailing `Z`, then bare dates.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    let stripped = raw.strip_suffix('Z').unwrap_or(raw);
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(stripped, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(stripped, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

struct Observed<'a> {
    at: NaiveDateTime,
    raw: &'a str,
    age_days: Option<f64>,
}

/// Fold every observation of one source into a single freshness record.
///
/// All timestamp fields of every record are considered. The result's
/// `last_updated` is the latest parsable value (with the age reported next
/// to it) and min/max bound every parsable value. When nothing parses, the
/// first non-empty raw string stands in for all three. Returns `None` only
/// for an empty iterator.
pub fn fold_freshness<'a>(
    source: &str,
    records: impl IntoIterator<Item = &'a Freshness>,
) -> Option<Freshness> {
    let mut min: Option<Observed<'a>> = None;
    let mut max: Option<Observed<'a>> = None;
    let mut first_raw: Option<(&'a str, Option<f64>)> = None;
    let mut first_age: Option<Option<f64>> = None;

    for record in records {
        first_age.get_or_insert(record.age_days);
        let fields = [
            Some(record.last_updated.as_str()),
            record.min_last_updated.as_deref(),
            record.max_last_updated.as_deref(),
        ];
        for raw in fields.into_iter().flatten().map(str::trim) {
            if raw.is_empty() {
                continue;
            }
            first_raw.get_or_insert((raw, record.age_days));
            let Some(at) = parse_timestamp(raw) else {
                continue;
            };
            if min.as_ref().map_or(true, |m| at < m.at) {
                min = Some(Observed {
                    at,
                    raw,
                    age_days: record.age_days,
                });
            }
            if max.as_ref().map_or(true, |m| at > m.at) {
                max = Some(Observed {
                    at,
                    raw,
                    age_days: record.age_days,
                });
            }
        }
    }

    let age_days = first_age?;
    let folded = match (min, max) {
        (Some(min), Some(max)) => Freshness {
            source: source.to_string(),
            last_updated: max.raw.to_string(),
            age_days: max.age_days,
            min_last_updated: Some(min.raw.to_string()),
            max_last_updated: Some(max.raw.to_string()),
        },
        _ => match first_raw {
            Some((raw, age_days)) => Freshness {
                source: source.to_string(),
                last_updated: raw.to_string(),
                age_days,
                min_last_updated: Some(raw.to_string()),
                max_last_updated: Some(raw.to_string()),
            },
            None => Freshness {
                source: source.to_string(),
                last_updated: String::new(),
                age_days,
                min_last_updated: None,
                max_last_updated: None,
            },
        },
    };
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::result::TraceError;

    fn result(intent: &str) -> PartialResult {
        PartialResult {
            ok: true,
            intent: intent.to_string(),
            sections: vec![],
            citations: vec![],
            freshness: BTreeMap::new(),
            reproducibility: vec![],
            combined_reproducibility: None,
            warnings: vec![],
            traces: vec![],
        }
    }

    fn trace(intent: &str, attempt: u32, elapsed_ms: u64) -> ExecutionTrace {
        ExecutionTrace {
            intent: intent.to_string(),
            agent_name: "agent".to_string(),
            method: "run".to_string(),
            elapsed_ms,
            attempt,
            success: true,
            warnings: vec![],
            error: None,
        }
    }

    #[test]
    fn test_empty_merge_fails() {
        assert!(matches!(merge_results(&[]), Err(ConvoyError::EmptyMerge)));
    }

    #[test]
    fn test_unknown_titles_sort_last_in_input_order() {
        let mut a = result("a");
        a.sections = vec![
            Section::new("Appendix", "one"),
            Section::new("Warnings", "w"),
            Section::new("Glossary", "two"),
            Section::new("executive summary (credit)", "s"),
        ];
        let merged = merge_results(&[a]).unwrap();
        let titles: Vec<&str> = merged.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["executive summary (credit)", "Warnings", "Appendix", "Glossary"]
        );
    }

    #[test]
    fn test_section_dedupe_uses_first_forty_chars() {
        let prefix = "x".repeat(40);
        let mut a = result("a");
        a.sections = vec![Section::new("Evidence", format!("{prefix}-first"))];
        let mut b = result("b");
        b.sections = vec![
            Section::new("EVIDENCE", format!("{prefix}-second")),
            Section::new("Evidence", "different"),
        ];
        let merged = merge_results(&[a, b]).unwrap();
        assert_eq!(merged.sections.len(), 2);
        assert!(merged.sections[0].body.ends_with("-first"));
    }

    #[test]
    fn test_section_bodies_and_warnings_are_redacted() {
        let mut a = result("a");
        a.sections = vec![Section::new("Key Findings", "reach ops@bank.com")];
        a.warnings = vec!["  call 5551234567890 ".to_string(), String::new()];
        let merged = merge_results(&[a]).unwrap();
        assert_eq!(merged.sections[0].body, "reach [REDACTED_EMAIL]");
        assert_eq!(merged.warnings, vec!["call [REDACTED_NUMBER]".to_string()]);
    }

    #[test]
    fn test_warnings_dedupe_after_redaction() {
        let mut a = result("a");
        a.warnings = vec!["mail a@x.io".to_string(), "zeta".to_string()];
        let mut b = result("b");
        b.warnings = vec!["mail b@y.io".to_string(), "alpha".to_string()];
        let merged = merge_results(&[a, b]).unwrap();
        assert_eq!(merged.warnings, vec!["mail [REDACTED_EMAIL]", "zeta", "alpha"]);
    }

    #[test]
    fn test_citations_first_wins_and_sorted() {
        let mut a = result("a");
        a.citations = vec![
            Citation {
                description: "first".to_string(),
                ..Citation::new("q2", "d2")
            },
            Citation::new("q9", "d1"),
        ];
        let mut b = result("b");
        b.citations = vec![Citation {
            description: "second".to_string(),
            ..Citation::new("q2", "d2")
        }];
        let merged = merge_results(&[a, b]).unwrap();
        assert_eq!(merged.citations.len(), 2);
        assert_eq!(merged.citations[0].dataset_id, "d1");
        assert_eq!(merged.citations[1].description, "first");
    }

    #[test]
    fn test_traces_dedupe_and_sort() {
        let mut a = result("a");
        a.traces = vec![trace("b", 1, 5), trace("a", 2, 1), trace("a", 1, 9)];
        let mut b = result("b");
        let mut failed = trace("a", 1, 3);
        failed.success = false;
        failed.error = Some(TraceError {
            kind: ErrorKind::Internal,
            message: "boom".to_string(),
        });
        b.traces = vec![failed];
        let merged = merge_results(&[a, b]).unwrap();
        let keys: Vec<(&str, u32, u64)> = merged
            .traces
            .iter()
            .map(|t| (t.intent.as_str(), t.attempt, t.elapsed_ms))
            .collect();
        assert_eq!(keys, vec![("a", 1, 9), ("a", 2, 1), ("b", 1, 5)]);
    }

    #[test]
    fn test_ok_is_conjunction_and_intents_join_sorted() {
        let a = result("zeta");
        let mut b = result("alpha");
        b.ok = false;
        let merged = merge_results(&[a.clone(), b]).unwrap();
        assert!(!merged.ok);
        assert_eq!(merged.intent, "alpha,zeta");
        assert!(merge_results(&[a]).unwrap().ok);
    }

    #[test]
    fn test_reproducibility_dedupes_and_combines() {
        let at = Utc::now();
        let rep = |method: &str, offset: i64| Reproducibility {
            method: method.to_string(),
            params: Params::new(),
            timestamp: at + chrono::Duration::seconds(offset),
        };
        let mut a = result("a");
        a.reproducibility = vec![rep("b.run", 5)];
        let mut b = result("b");
        b.reproducibility = vec![rep("a.run", 0), rep("b.run", 5)];
        let merged = merge_results(&[a, b]).unwrap();
        let methods: Vec<&str> = merged
            .reproducibility
            .iter()
            .map(|r| r.method.as_str())
            .collect();
        assert_eq!(methods, vec!["a.run", "b.run"]);
        assert_eq!(
            merged.combined_reproducibility.unwrap().method,
            "a.run,b.run"
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 3)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap();
        for raw in [
            "2024-01-03T00:00:00Z",
            "2024-01-03T00:00:00+00:00",
            "2024-01-03T00:00:00",
            "2024-01-03 00:00:00",
            "2024-01-03",
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected), "{raw}");
        }
        assert_eq!(parse_timestamp("last tuesday"), None);
    }

    #[test]
    fn test_fold_freshness_tracks_bounds_and_age() {
        let records = [
            Freshness::new("ds1", "2024-01-02T00:00:00Z").with_age_days(2.0),
            Freshness::new("ds1", "2024-01-05").with_age_days(0.5),
            Freshness::new("ds1", "garbage"),
            Freshness::new("ds1", "2024-01-01 12:00:00").with_age_days(3.0),
        ];
        let folded = fold_freshness("ds1", records.iter()).unwrap();
        assert_eq!(folded.last_updated, "2024-01-05");
        assert_eq!(folded.age_days, Some(0.5));
        assert_eq!(folded.min_last_updated.as_deref(), Some("2024-01-01 12:00:00"));
        assert_eq!(folded.max_last_updated.as_deref(), Some("2024-01-05"));
    }

    #[test]
    fn test_fold_freshness_falls_back_to_first_raw() {
        let records = [
            Freshness::new("ds1", ""),
            Freshness::new("ds1", "yesterday"),
            Freshness::new("ds1", "today"),
        ];
        let folded = fold_freshness("ds1", records.iter()).unwrap();
        assert_eq!(folded.last_updated, "yesterday");
        assert_eq!(folded.min_last_updated.as_deref(), Some("yesterday"));
        assert_eq!(folded.max_last_updated.as_deref(), Some("yesterday"));
        assert!(fold_freshness("ds1", []).is_none());
    }
}
