//! Task status and the result envelope exchanged with workers

use serde::{Deserialize, Serialize};

use crate::{Result, TaskError};

/// Task state as reported by Celery workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task is waiting to be picked up (or unknown to the backend)
    #[default]
    Pending,
    /// Task has been received by a worker
    Received,
    /// Task is being executed
    Started,
    /// Task completed successfully
    Success,
    /// Task failed permanently
    Failure,
    /// Task is being retried
    Retry,
    /// Task was revoked/cancelled
    Revoked,
}

impl TaskStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }
}

/// Result message stored and transmitted by result backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: serde_json::Value,
    pub traceback: Option<String>,
    pub children: Vec<serde_json::Value>,
}

impl ResultEnvelope {
    /// Create a success envelope
    pub fn success(task_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Success,
            result,
            traceback: None,
            children: Vec::new(),
        }
    }

    /// Create a failure envelope
    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failure,
            result: serde_json::Value::String(error.into()),
            traceback: None,
            children: Vec::new(),
        }
    }

    /// Decode the `result` field into a caller-chosen type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.result.clone())
            .map_err(|e| TaskError::Deserialization(format!("Failed to decode result: {}", e)))
    }
}
