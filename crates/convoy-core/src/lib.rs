//! Convoy Core Library
//!
//! Coordinates batches of agent calls (single, bounded-parallel waves, or
//! sequential with dependencies), isolates per-call failures and soft
//! timeouts, and folds the partial results into one deterministic,
//! PII-redacted merged result.

pub mod coordinator;
pub mod deadline;
pub mod error;
pub mod executor;
pub mod merge;
pub mod metrics;
pub mod normalize;
pub mod obs;
pub mod params;
pub mod placeholder;
pub mod planner;
pub mod policy;
pub mod redact;
pub mod registry;
pub mod report;
pub mod result;
pub mod telemetry;

pub use coordinator::{
    preview, BatchPlan, BatchReport, BatchRequest, Coordinator, MANDATORY_SECTIONS,
};
pub use deadline::{Clock, DeadlineTracker, ManualClock, SystemClock};
pub use error::{
    AgentError, ConvoyError, ConvoyResult, DependencyViolation, ErrorKind, ParamViolation,
    RegistryError,
};
pub use executor::{AliasStatusMap, CallOutcome, ExecutionReport, WaveExecutor};
pub use merge::{fold_freshness, merge_results, parse_timestamp, SECTION_PRIORITY};
pub use metrics::{Metrics, MetricsObserver, METRICS};
pub use normalize::{
    batch_fingerprint, normalize_specs, validate_dependencies, CallSpec, NormalizedSpec,
};
pub use obs::{
    BatchSpan, FanoutObserver, NoopObserver, Observer, RecordingObserver, TracingObserver,
};
pub use params::{ParamKind, ParamSpec, ParamValue, Params};
pub use placeholder::{from_report, placeholder, SOFT_TIMEOUT_WARNING};
pub use planner::{plan, ExecutionMode, Wave};
pub use policy::{select_policy, Complexity, Policy, PolicyConfig, RetryPolicy};
pub use redact::redact;
pub use registry::{Agent, AgentRegistry, InMemoryRegistry, PrefetchCache, Resolution};
pub use report::{Evidence, Finding, StructuredReport};
pub use result::{
    Citation, ExecutionTrace, Freshness, MergedResult, PartialResult, Reproducibility, Section,
    TraceError,
};
pub use telemetry::init_tracing;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
