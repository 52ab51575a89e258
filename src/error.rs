//! Error types for the chart optimizer.
//!
//! One enum covers the whole taxonomy: configuration errors, renderer
//! errors, indeterminate verification, apply errors and rule failures.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while parsing, checking, verifying or patching charts.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Filesystem access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chart.yaml exists but cannot be read or parsed
    #[error("Invalid chart metadata in {path}: {message}")]
    ChartMetadata { path: PathBuf, message: String },

    /// Values content is not a YAML mapping
    #[error("Malformed values: {0}")]
    MalformedValues(String),

    /// YAML (de)serialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON report serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The rendering binary is not installed
    #[error("helm binary not found in PATH")]
    HelmMissing,

    /// The renderer exited non-zero
    #[error("Render failed: {0}")]
    RenderFailed(String),

    /// The renderer did not finish in time
    #[error("Render timed out after {seconds}s")]
    RenderTimeout { seconds: u64 },

    /// Rendering succeeded but the rule could not be evaluated on its output
    #[error("Verification indeterminate: {0}")]
    VerificationIndeterminate(String),

    /// A patch target resolves outside the chart root or templates directory
    #[error("Patch path escapes chart: {path}")]
    PathEscapesChart { path: String },

    /// A hunk's context or removal line did not match the target file
    #[error("Hunk mismatch in {file} at line {line}: expected {expected:?}, found {found:?}")]
    HunkMismatch {
        file: String,
        line: usize,
        expected: String,
        found: String,
    },

    /// Unified diff text could not be parsed
    #[error("Malformed diff: {0}")]
    MalformedDiff(String),

    /// A file changed between snapshot and promotion
    #[error("Concurrent modification detected: {path} changed since it was staged")]
    ConcurrentModification { path: PathBuf },

    /// A rule check failed on its input
    #[error("Rule {rule} failed: {message}")]
    RuleCheck { rule: String, message: String },

    /// Optimizer configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for optimizer operations
pub type Result<T> = std::result::Result<T, OptimizerError>;
