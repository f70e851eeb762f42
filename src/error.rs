//! Unified error handling for the aggregation engine.
//!
//! Row-level problems are not errors here: they are [`RejectReason`]s
//! collected by the map workers and reported in the run diagnostics.
//! `EngineError` covers everything that stops a source, a phase, or a run.
//!
//! [`RejectReason`]: crate::normalize::RejectReason

use thiserror::Error;

/// Errors produced by the engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required configuration parameter is missing or invalid.
    #[error("invalid configuration for `{parameter}`: {reason}")]
    Configuration { parameter: String, reason: String },

    /// A row source could not be read.
    #[error("source '{source_label}' is unreadable: {reason}")]
    SourceUnreadable {
        source_label: String,
        reason: String,
    },

    /// A worker could not produce a partial aggregate for its source.
    #[error("worker for '{source_label}' failed: {reason}")]
    WorkerFailure {
        source_label: String,
        reason: String,
    },

    /// A per-device sequence broke the global ordering or count invariants.
    #[error("merge invariant violated for device '{device_id}': {detail}")]
    MergeInvariantViolation { device_id: String, detail: String },

    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl EngineError {
    /// Shorthand for a configuration error.
    pub fn config(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Configuration {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is fatal to the whole run rather than to one source.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::SourceUnreadable { .. } | EngineError::WorkerFailure { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Conversions from `Option` into engine errors.
pub trait OptionExt<T> {
    /// Turn `None` into a configuration error naming the missing parameter.
    fn ok_or_config(self, parameter: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_config(self, parameter: &str) -> Result<T> {
        self.ok_or_else(|| EngineError::config(parameter, "required parameter is missing"))
    }
}
