//! Concurrency, timeout and retry limits for a batch.
//!
//! [`PolicyConfig`] is the serde-facing description; [`Policy`] is the
//! validated, immutable form every other component reads.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConvoyError, ConvoyResult, ErrorKind};

/// Minimum allowed per-agent timeout.
pub const MIN_PER_AGENT_TIMEOUT_MS: u64 = 1_000;

/// Raw policy settings, as loaded from JSON or the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub max_parallel: usize,
    pub crisis_parallel: usize,
    pub per_agent_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub retry_transient: u32,
    #[serde(default)]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub strict_merge: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Complexity::Medium.config()
    }
}

impl PolicyConfig {
    /// Start from the `medium` policy and apply `CONVOY_*` overrides.
    pub fn from_env() -> ConvoyResult<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("CONVOY_MAX_PARALLEL")? {
            config.max_parallel = v;
        }
        if let Some(v) = env_parse("CONVOY_CRISIS_PARALLEL")? {
            config.crisis_parallel = v;
        }
        if let Some(v) = env_parse("CONVOY_PER_AGENT_TIMEOUT_MS")? {
            config.per_agent_timeout_ms = v;
        }
        if let Some(v) = env_parse("CONVOY_TOTAL_TIMEOUT_MS")? {
            config.total_timeout_ms = v;
        }
        if let Some(v) = env_parse("CONVOY_RETRY_TRANSIENT")? {
            config.retry_transient = v;
        }
        if let Some(v) = env_parse("CONVOY_RETRY_BACKOFF_MS")? {
            config.retry_backoff_ms = v;
        }
        if let Some(v) = env_parse("CONVOY_STRICT_MERGE")? {
            config.strict_merge = v;
        }
        Ok(config)
    }
}

fn env_parse<T>(name: &str) -> ConvoyResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConvoyError::InvalidEnv {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Validated batch policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    max_parallel: usize,
    crisis_parallel: usize,
    per_agent_timeout_ms: u64,
    total_timeout_ms: u64,
    retry_transient: u32,
    retry_backoff_ms: u64,
    strict_merge: bool,
}

impl Policy {
    /// Validate `config` and freeze it.
    ///
    /// Every violated bound is reported in the error message.
    pub fn new(config: PolicyConfig) -> ConvoyResult<Self> {
        let mut problems = Vec::new();
        if config.max_parallel < 1 {
            problems.push("max_parallel must be >= 1".to_string());
        }
        if config.crisis_parallel < config.max_parallel {
            problems.push(format!(
                "crisis_parallel ({}) must be >= max_parallel ({})",
                config.crisis_parallel, config.max_parallel
            ));
        }
        if config.per_agent_timeout_ms < MIN_PER_AGENT_TIMEOUT_MS {
            problems.push(format!(
                "per_agent_timeout_ms ({}) must be >= {MIN_PER_AGENT_TIMEOUT_MS}",
                config.per_agent_timeout_ms
            ));
        }
        if config.total_timeout_ms < config.per_agent_timeout_ms {
            problems.push(format!(
                "total_timeout_ms ({}) must be >= per_agent_timeout_ms ({})",
                config.total_timeout_ms, config.per_agent_timeout_ms
            ));
        }
        if !problems.is_empty() {
            return Err(ConvoyError::InvalidPolicy(problems.join("; ")));
        }

        Ok(Self {
            max_parallel: config.max_parallel,
            crisis_parallel: config.crisis_parallel,
            per_agent_timeout_ms: config.per_agent_timeout_ms,
            total_timeout_ms: config.total_timeout_ms,
            retry_transient: config.retry_transient,
            retry_backoff_ms: config.retry_backoff_ms,
            strict_merge: config.strict_merge,
        })
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn crisis_parallel(&self) -> usize {
        self.crisis_parallel
    }

    pub fn per_agent_timeout_ms(&self) -> u64 {
        self.per_agent_timeout_ms
    }

    pub fn total_timeout_ms(&self) -> u64 {
        self.total_timeout_ms
    }

    pub fn retry_transient(&self) -> u32 {
        self.retry_transient
    }

    pub fn retry_backoff_ms(&self) -> u64 {
        self.retry_backoff_ms
    }

    pub fn strict_merge(&self) -> bool {
        self.strict_merge
    }

    /// Total attempts a retryable call may make.
    pub fn max_attempts(&self) -> u32 {
        self.retry_transient.saturating_add(1)
    }

    /// Worker bound for a batch: `crisis_parallel` for crisis batches.
    pub fn effective_parallelism(&self, crisis: bool) -> usize {
        if crisis {
            self.crisis_parallel
        } else {
            self.max_parallel
        }
    }

    /// Snapshot back into the serde form.
    pub fn to_config(&self) -> PolicyConfig {
        PolicyConfig {
            max_parallel: self.max_parallel,
            crisis_parallel: self.crisis_parallel,
            per_agent_timeout_ms: self.per_agent_timeout_ms,
            total_timeout_ms: self.total_timeout_ms,
            retry_transient: self.retry_transient,
            retry_backoff_ms: self.retry_backoff_ms,
            strict_merge: self.strict_merge,
        }
    }
}

impl TryFrom<PolicyConfig> for Policy {
    type Error = ConvoyError;

    fn try_from(config: PolicyConfig) -> ConvoyResult<Self> {
        Policy::new(config)
    }
}

/// Coarse request complexity used to pick a canned policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
    Crisis,
}

impl Complexity {
    /// Canned settings for this complexity.
    ///
    /// | label   | parallel | crisis | per-agent | total  | retries | strict |
    /// |---------|----------|--------|-----------|--------|---------|--------|
    /// | simple  | 2        | 4      | 8 s       | 20 s   | 1       | yes    |
    /// | medium  | 4        | 6      | 12 s      | 45 s   | 1       | no     |
    /// | complex | 6        | 8      | 20 s      | 90 s   | 2       | no     |
    /// | crisis  | 8        | 12     | 5 s       | 15 s   | 0       | no     |
    pub fn config(self) -> PolicyConfig {
        match self {
            Complexity::Simple => PolicyConfig {
                max_parallel: 2,
                crisis_parallel: 4,
                per_agent_timeout_ms: 8_000,
                total_timeout_ms: 20_000,
                retry_transient: 1,
                retry_backoff_ms: 200,
                strict_merge: true,
            },
            Complexity::Medium => PolicyConfig {
                max_parallel: 4,
                crisis_parallel: 6,
                per_agent_timeout_ms: 12_000,
                total_timeout_ms: 45_000,
                retry_transient: 1,
                retry_backoff_ms: 250,
                strict_merge: false,
            },
            Complexity::Complex => PolicyConfig {
                max_parallel: 6,
                crisis_parallel: 8,
                per_agent_timeout_ms: 20_000,
                total_timeout_ms: 90_000,
                retry_transient: 2,
                retry_backoff_ms: 500,
                strict_merge: false,
            },
            Complexity::Crisis => PolicyConfig {
                max_parallel: 8,
                crisis_parallel: 12,
                per_agent_timeout_ms: 5_000,
                total_timeout_ms: 15_000,
                retry_transient: 0,
                retry_backoff_ms: 0,
                strict_merge: false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
            Complexity::Crisis => "crisis",
        }
    }
}

impl FromStr for Complexity {
    type Err = ConvoyError;

    fn from_str(s: &str) -> ConvoyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Complexity::Simple),
            "medium" => Ok(Complexity::Medium),
            "complex" => Ok(Complexity::Complex),
            "crisis" => Ok(Complexity::Crisis),
            _ => Err(ConvoyError::UnknownComplexity(s.to_string())),
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a complexity label to its canned policy.
pub fn select_policy(complexity: Complexity) -> Policy {
    let config = complexity.config();
    // Canned configs satisfy every bound checked in `Policy::new`.
    Policy {
        max_parallel: config.max_parallel,
        crisis_parallel: config.crisis_parallel,
        per_agent_timeout_ms: config.per_agent_timeout_ms,
        total_timeout_ms: config.total_timeout_ms,
        retry_transient: config.retry_transient,
        retry_backoff_ms: config.retry_backoff_ms,
        strict_merge: config.strict_merge,
    }
}

/// Which per-call error kinds are worth another attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    retryable: BTreeMap<ErrorKind, bool>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
            .with(ErrorKind::Transient, true)
            .with(ErrorKind::Timeout, true)
    }
}

impl RetryPolicy {
    /// Nothing is retried.
    pub fn none() -> Self {
        Self {
            retryable: BTreeMap::new(),
        }
    }

    /// Set whether `kind` is retryable (builder pattern).
    pub fn with(mut self, kind: ErrorKind, retryable: bool) -> Self {
        self.retryable.insert(kind, retryable);
        self
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.get(&kind).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canned_policies_pass_validation() {
        for complexity in [
            Complexity::Simple,
            Complexity::Medium,
            Complexity::Complex,
            Complexity::Crisis,
        ] {
            let validated = Policy::new(complexity.config()).unwrap();
            assert_eq!(validated, select_policy(complexity));
        }
    }

    #[test]
    fn test_only_simple_enables_strict_merge() {
        assert!(select_policy(Complexity::Simple).strict_merge());
        assert!(!select_policy(Complexity::Medium).strict_merge());
        assert!(!select_policy(Complexity::Complex).strict_merge());
        assert!(!select_policy(Complexity::Crisis).strict_merge());
    }

    #[test]
    fn test_crisis_trades_retries_for_speed() {
        let crisis = select_policy(Complexity::Crisis);
        let complex = select_policy(Complexity::Complex);
        assert_eq!(crisis.retry_transient(), 0);
        assert!(crisis.per_agent_timeout_ms() < complex.per_agent_timeout_ms());
        assert!(crisis.max_parallel() > complex.max_parallel());
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let config = PolicyConfig {
            max_parallel: 0,
            ..PolicyConfig::default()
        };
        assert!(matches!(
            Policy::new(config),
            Err(ConvoyError::InvalidPolicy(msg)) if msg.contains("max_parallel")
        ));
    }

    #[test]
    fn test_rejects_crisis_parallel_below_max_parallel() {
        let config = PolicyConfig {
            max_parallel: 4,
            crisis_parallel: 2,
            ..PolicyConfig::default()
        };
        assert!(Policy::new(config).is_err());
    }

    #[test]
    fn test_rejects_short_per_agent_timeout() {
        let config = PolicyConfig {
            per_agent_timeout_ms: 999,
            ..PolicyConfig::default()
        };
        assert!(Policy::new(config).is_err());
    }

    #[test]
    fn test_rejects_total_timeout_below_per_agent() {
        let config = PolicyConfig {
            per_agent_timeout_ms: 5_000,
            total_timeout_ms: 4_000,
            ..PolicyConfig::default()
        };
        let err = Policy::new(config).unwrap_err().to_string();
        assert!(err.contains("total_timeout_ms"));
    }

    #[test]
    fn test_reports_all_violations() {
        let config = PolicyConfig {
            max_parallel: 0,
            crisis_parallel: 0,
            per_agent_timeout_ms: 10,
            total_timeout_ms: 1,
            retry_transient: 0,
            retry_backoff_ms: 0,
            strict_merge: false,
        };
        let err = Policy::new(config).unwrap_err().to_string();
        assert!(err.contains("max_parallel"));
        assert!(err.contains("per_agent_timeout_ms"));
        assert!(err.contains("total_timeout_ms"));
    }

    #[test]
    fn test_complexity_parses_case_insensitively() {
        assert_eq!("CRISIS".parse::<Complexity>().unwrap(), Complexity::Crisis);
        assert!("urgent".parse::<Complexity>().is_err());
    }

    #[test]
    fn test_effective_parallelism_uses_crisis_bound() {
        let policy = select_policy(Complexity::Medium);
        assert_eq!(policy.effective_parallelism(false), 4);
        assert_eq!(policy.effective_parallelism(true), 6);
    }

    #[test]
    fn test_default_retry_policy_retries_transient_only_kinds() {
        let retry = RetryPolicy::default();
        assert!(retry.is_retryable(ErrorKind::Transient));
        assert!(retry.is_retryable(ErrorKind::Timeout));
        assert!(!retry.is_retryable(ErrorKind::InvalidInput));
        assert!(!retry.is_retryable(ErrorKind::Panicked));

        let tuned = RetryPolicy::default().with(ErrorKind::Timeout, false);
        assert!(!tuned.is_retryable(ErrorKind::Timeout));
    }
}
