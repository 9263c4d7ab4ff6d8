//! Error types for the Heddle workflow engine.
//!
//! This module defines the error types used throughout the crate,
//! following the non-exhaustive enum pattern to allow future error variants
//! without breaking compatibility.

use std::time::Duration;

use thiserror::Error;

/// The main error type for Heddle operations.
///
/// This enum uses `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking backward compatibility.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HeddleError {
    /// Workflow configuration or structure is invalid.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Duplicate step name in workflow.
    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    /// An event was produced that no registered step consumes.
    #[error("No step consumes event {0}")]
    UnroutableEvent(String),

    /// A step was handed an event kind it cannot process.
    #[error("Step {step} expected {expected}, got {actual}")]
    UnexpectedEvent {
        /// The step that received the event.
        step: String,
        /// The kind the step expected.
        expected: String,
        /// The kind that actually arrived.
        actual: String,
    },

    /// Error raised from inside step code.
    #[error("Step execution error: {0}")]
    StepExecution(String),

    /// A step invocation failed and aborted the run.
    #[error("Step {step} failed: {source}")]
    StepFailed {
        /// The failing step.
        step: String,
        /// The underlying error.
        #[source]
        source: Box<HeddleError>,
    },

    /// A step invocation panicked or was cancelled unexpectedly.
    #[error("Step invocation panicked: {0}")]
    StepPanicked(String),

    /// The run exceeded its deadline.
    #[error("Run timed out after {0:?}")]
    Timeout(Duration),

    /// The event queue drained without a stop event being produced.
    #[error("Run stalled without producing a stop event: {0}")]
    Stalled(String),

    /// An event was sent after the run had finished.
    #[error("Run is closed")]
    RunClosed,

    /// The run task was aborted or could not be joined.
    #[error("Run aborted: {0}")]
    RunAborted(String),

    /// An external collaborator (file store, index, model, ...) failed.
    #[error("Service error: {0}")]
    Service(String),

    /// Data did not conform to the declared schema.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Error occurred in the record store layer.
    #[error("Record store error: {0}")]
    RecordStore(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Database error (for the SQLite record store).
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(String),
}

impl HeddleError {
    /// Wraps an error raised by `step` so the run reports where it failed.
    pub(crate) fn in_step(self, step: impl Into<String>) -> Self {
        match self {
            already @ HeddleError::StepFailed { .. } => already,
            other => HeddleError::StepFailed {
                step: step.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns true if this error is a run-level timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HeddleError::Timeout(_))
    }
}

/// A specialized `Result` type for Heddle operations.
///
/// This is a type alias for `std::result::Result<T, HeddleError>` to reduce
/// boilerplate in function signatures throughout the crate.
pub type Result<T> = std::result::Result<T, HeddleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_workflow() {
        let error = HeddleError::InvalidWorkflow("no steps".to_string());
        assert_eq!(error.to_string(), "Invalid workflow: no steps");
    }

    #[test]
    fn test_error_display_duplicate_step() {
        let error = HeddleError::DuplicateStep("download".to_string());
        assert_eq!(error.to_string(), "Duplicate step name: download");
    }

    #[test]
    fn test_error_display_unexpected_event() {
        let error = HeddleError::UnexpectedEvent {
            step: "extract".to_string(),
            expected: "FileDownloaded".to_string(),
            actual: "FileEvent".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Step extract expected FileDownloaded, got FileEvent"
        );
    }

    #[test]
    fn test_error_display_timeout() {
        let error = HeddleError::Timeout(Duration::from_secs(2));
        assert_eq!(error.to_string(), "Run timed out after 2s");
        assert!(error.is_timeout());
    }

    #[test]
    fn test_in_step_wraps_once() {
        let error = HeddleError::Service("connection reset".to_string())
            .in_step("download")
            .in_step("outer");

        match error {
            HeddleError::StepFailed { step, source } => {
                assert_eq!(step, "download");
                assert!(matches!(*source, HeddleError::Service(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_step_failed_exposes_source() {
        let error = HeddleError::StepExecution("boom".to_string()).in_step("s");
        let source = std::error::Error::source(&error).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Step execution error: boom"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: HeddleError = json_error.into();
        assert!(error.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: HeddleError = io_error.into();
        assert!(error.to_string().contains("I/O error"));
    }

    #[test]
    fn test_result_err() {
        let result: Result<i32> = Err(HeddleError::RunClosed);
        assert!(result.is_err());
    }
}
