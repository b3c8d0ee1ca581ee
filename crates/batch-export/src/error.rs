//! Error types for the export library.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::BatchStatus;

/// Main error type for export operations.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Configuration error (malformed base query, invalid YAML values,
    /// uncreatable or unwritable output path). Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Query execution against the data source failed.
    #[error("Data access error: {message}\n  Context: {context}")]
    DataAccess { message: String, context: String },

    /// Writing or flushing the output file failed.
    #[error("Write failed for {}: {message}", path.display())]
    Write { path: PathBuf, message: String },

    /// A status change the execution lifecycle does not allow.
    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: u64,
        from: BatchStatus,
        to: BatchStatus,
    },

    /// The job was stopped on request.
    #[error("Export cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExportError {
    /// Create a DataAccess error with context about where it occurred
    pub fn data_access(message: impl ToString, context: impl Into<String>) -> Self {
        ExportError::DataAccess {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Write error for an output path
    pub fn write(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        ExportError::Write {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// True for failures detected before a job could start.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ExportError::Config(_) | ExportError::Yaml(_))
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExportError::Config(_) | ExportError::Yaml(_) => 2,
            ExportError::DataAccess { .. } => 3,
            ExportError::Write { .. } => 4,
            ExportError::Cancelled => 130,
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

/// Result type alias for export operations.
pub type Result<T> = std::result::Result<T, ExportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExportError::Config("x".into()).exit_code(), 2);
        assert_eq!(ExportError::data_access("boom", "page").exit_code(), 3);
        assert_eq!(ExportError::write("/tmp/out.tsv", "disk full").exit_code(), 4);
        assert_eq!(ExportError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_data_access_message_includes_context() {
        let err = ExportError::data_access("no such table: users", "fetching page 1");
        let msg = err.to_string();
        assert!(msg.contains("no such table: users"));
        assert!(msg.contains("fetching page 1"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_format_detailed_walks_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = ExportError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: read-only"));
        assert!(detailed.contains("Caused by:"));
    }
}
