//! Typed error taxonomy shared across the refiner.
//!
//! Orchestration plumbing uses `anyhow`; these types cross those boundaries and
//! are recovered with `downcast_ref` where callers need to branch on them (CLI
//! exit codes, iteration policy).

use thiserror::Error;

/// Missing or invalid configuration. Fatal, surfaced before any session exists.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required placeholder(s): {}", .0.join(", "))]
    MissingPlaceholders(Vec<String>),

    #[error("unknown placeholder(s): {}", .0.join(", "))]
    UnknownPlaceholders(Vec<String>),

    #[error("placeholder {0} must not be empty")]
    EmptyPlaceholder(String),

    #[error("invalid prompt template: {0}")]
    Template(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of the external inference call.
///
/// `Transient` failures are retried with backoff by the caller; whatever
/// survives the retry budget is reported as `Permanent`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("transient inference failure: {0}")]
    Transient(String),

    #[error("inference failed permanently: {0}")]
    Permanent(String),
}

impl InferenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, InferenceError::Transient(_))
    }
}
