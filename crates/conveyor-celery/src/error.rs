//! Task client error types

use conveyor_sync::Rejection;
use thiserror::Error;

/// Error type for all task client operations.
///
/// Clonable because a single failure (a dropped connection, a rejected
/// subscription) often has to fan out to many parked result waiters.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Result ignored for this task")]
    ResultIgnored,

    #[error("Not connected")]
    NotConnected,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for TaskError {
    fn from(err: uuid::Error) -> Self {
        TaskError::InvalidTaskId(err.to_string())
    }
}

impl From<Rejection> for TaskError {
    fn from(rejection: Rejection) -> Self {
        TaskError::Backend(rejection.to_string())
    }
}

/// Result type for task operations
pub type Result<T> = std::result::Result<T, TaskError>;
