//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration and reconciliation operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, empty entity kinds, zero batch size, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Legacy store read failure. Fatal for a run.
    #[error("Source store error: {0}")]
    Source(String),

    /// Target store call failed. Transient failures are retried with backoff.
    #[error("Target store error{}: {message}", transient_suffix(.transient))]
    Target { message: String, transient: bool },

    /// A record could not be mapped into its target representation.
    #[error("Mapping failed for record {record_id}: {message}")]
    Mapping { record_id: String, message: String },

    /// Backup snapshot could not be taken or persisted.
    #[error("Backup error: {0}")]
    Backup(String),

    /// A repair action failed while executing.
    #[error("Fix execution failed for gap {gap_id}: {message}")]
    FixExecution { gap_id: String, message: String },

    /// Audit artifact could not be read back or failed its integrity check.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a source error.
    pub fn source(message: impl Into<String>) -> Self {
        MigrateError::Source(message.into())
    }

    /// Create a non-retryable target error.
    pub fn target(message: impl Into<String>) -> Self {
        MigrateError::Target {
            message: message.into(),
            transient: false,
        }
    }

    /// Create a retryable target error.
    pub fn target_transient(message: impl Into<String>) -> Self {
        MigrateError::Target {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a mapping error for a record.
    pub fn mapping(record_id: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Mapping {
            record_id: record_id.into(),
            message: message.into(),
        }
    }

    /// Create a fix execution error for a gap.
    pub fn fix(gap_id: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::FixExecution {
            gap_id: gap_id.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MigrateError::Target { transient: true, .. })
    }

    /// Whether the error must stop a run regardless of `continue_on_error`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Config(_) | MigrateError::Source(_) | MigrateError::Cancelled
        )
    }

    /// Process exit code for this error when it escapes the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

fn transient_suffix(transient: &bool) -> &'static str {
    if *transient {
        " (transient)"
    } else {
        ""
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
