//! Error taxonomy for batch coordination.
//!
//! Two families live here:
//! - [`ConvoyError`]: configuration and batch-level failures. These abort a
//!   batch and never carry partial output.
//! - [`AgentError`] / [`ErrorKind`]: failures of a single agent call. The
//!   executor converts these into failed placeholder results; they never
//!   escape as `Err`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed classification of a per-call failure.
///
/// Retry decisions match on this kind (see
/// [`RetryPolicy`](crate::policy::RetryPolicy)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary upstream condition (connection reset, rate limit, ...).
    Transient,
    /// The agent gave up waiting on something it depends on.
    Timeout,
    /// The agent rejected its parameters.
    InvalidInput,
    /// Requested data does not exist.
    NotFound,
    /// Any other failure inside the agent.
    Internal,
    /// The agent panicked; caught at the worker boundary.
    Panicked,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
            ErrorKind::Panicked => "panicked",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one agent call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }
}

/// Errors raised by an [`AgentRegistry`](crate::registry::AgentRegistry).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown intent '{intent}' (known intents: {})", .known.join(", "))]
    UnknownIntent { intent: String, known: Vec<String> },

    #[error("intent '{intent}' is already registered")]
    DuplicateIntent { intent: String },
}

/// A single broken edge in the `depends_on` graph of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyViolation {
    /// `alias` depends on an alias that is not part of the batch.
    UnknownTarget { alias: String, target: String },
    /// `alias` lists itself in `depends_on`.
    SelfDependency { alias: String },
    /// Aliases that depend on each other in a loop. The first alias is
    /// repeated at the end.
    Cycle { path: Vec<String> },
}

impl fmt::Display for DependencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyViolation::UnknownTarget { alias, target } => {
                write!(f, "'{alias}' depends on unknown alias '{target}'")
            }
            DependencyViolation::SelfDependency { alias } => {
                write!(f, "'{alias}' depends on itself")
            }
            DependencyViolation::Cycle { path } => {
                write!(f, "dependency cycle {}", path.join(" -> "))
            }
        }
    }
}

/// A parameter that does not match the registry's declared signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamViolation {
    Unsupported { alias: String, param: String },
    Missing { alias: String, param: String },
    WrongType {
        alias: String,
        param: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for ParamViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamViolation::Unsupported { alias, param } => {
                write!(f, "'{alias}': unsupported parameter '{param}'")
            }
            ParamViolation::Missing { alias, param } => {
                write!(f, "'{alias}': missing required parameter '{param}'")
            }
            ParamViolation::WrongType {
                alias,
                param,
                expected,
                actual,
            } => write!(
                f,
                "'{alias}': parameter '{param}' expects {expected}, got {actual}"
            ),
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration and batch-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ConvoyError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("unknown complexity label '{0}' (expected simple, medium, complex or crisis)")]
    UnknownComplexity(String),

    #[error("invalid execution mode '{0}' (expected single, parallel or sequential)")]
    InvalidMode(String),

    #[error("batch contains no call specs")]
    EmptyBatch,

    #[error("mode 'single' requires exactly one call spec, got {count}")]
    SingleModeArity { count: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(
        "method mismatch for intent '{intent}': declared '{declared}', \
         registry expects '{canonical}'"
    )]
    MethodMismatch {
        intent: String,
        declared: String,
        canonical: String,
    },

    #[error("duplicate alias '{alias}' in batch")]
    DuplicateAlias { alias: String },

    #[error("invalid dependency graph: {}", join_display(.violations))]
    InvalidDependencies { violations: Vec<DependencyViolation> },

    #[error("invalid parameters: {}", join_display(.violations))]
    InvalidParams { violations: Vec<ParamViolation> },

    #[error("'{alias}' depends on '{target}', which does not run in an earlier wave")]
    ForwardDependency { alias: String, target: String },

    #[error("batch produced no results")]
    NoResults,

    #[error("merge requires at least one partial result")]
    EmptyMerge,

    #[error("strict merge failed: missing mandatory sections: {}", .missing.join(", "))]
    StrictMergeViolation { missing: Vec<String> },

    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnv { name: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for convoy operations.
pub type ConvoyResult<T> = std::result::Result<T, ConvoyError>;
