//! Step processing error types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::StepKind;

/// Errors a step processor can surface while producing a step's output.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessingError {
    /// The step did not settle before its timeout elapsed.
    #[error("Step timed out after {0} ms")]
    Timeout(u64),

    /// The execution was cancelled while the step was in flight.
    #[error("Step cancelled")]
    Cancelled,

    /// The backing service answered with a non-success status.
    #[error("Service returned status {status}: {message}")]
    Service { status: u16, message: String },

    /// The backing service could not be reached.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The step configuration or context is not acceptable for this processor.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backing service answered with a body the processor cannot use.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// No processor is registered for the step kind.
    #[error("No processor registered for step type '{0}'")]
    NotRegistered(StepKind),
}

impl ProcessingError {
    /// Stable machine-readable code recorded on step and execution errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Service { .. } => "SERVICE_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
            Self::Json(_) => "JSON_ERROR",
            Self::NotRegistered(_) => "UNKNOWN_STEP_TYPE",
        }
    }

    /// Configuration errors abort a run regardless of the error-handling policy.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotRegistered(_))
    }

    /// Whether re-invoking the step could plausibly succeed.
    ///
    /// Timeouts are final: the step timeout bounds the step, not one attempt.
    pub fn is_retryable(&self) -> bool {
        !self.is_configuration() && !matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(e: serde_json::Error) -> Self {
        ProcessingError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for ProcessingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProcessingError::Http(format!("request timed out: {}", e))
        } else {
            ProcessingError::Http(e.to_string())
        }
    }
}

/// Code, message and time of a failure, as recorded on steps and executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Stamp a processing error with the current time.
    pub fn from_processing(err: &ProcessingError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<&ProcessingError> for ErrorRecord {
    fn from(err: &ProcessingError) -> Self {
        ErrorRecord::from_processing(err)
    }
}
