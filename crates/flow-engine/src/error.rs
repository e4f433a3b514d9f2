//! Error types for the flow engine.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by engine operations.
///
/// Step failures are never reported here: they are recorded on the
/// execution's step records and surface through its final status.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The flow definition is structurally invalid
    #[error("Invalid flow definition: {0}")]
    InvalidFlow(String),

    /// No active execution with this id
    #[error("Execution not found: {0}")]
    NotFound(Uuid),

    /// Flow definition could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background run task failed to complete
    #[error("Run task failed: {0}")]
    Join(String),
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Join(err.to_string())
    }
}
