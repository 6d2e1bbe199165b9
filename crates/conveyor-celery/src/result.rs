//! Handle on the eventual result of a published task

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;

use crate::backend::Backend;
use crate::state::ResultEnvelope;
use crate::{Result, TaskError};

/// Future-like handle returned by `apply_async`.
///
/// Construction immediately starts one `get` against the backend; the
/// outcome is memoized, so repeated `get` calls observe the same envelope
/// and a timed-out call does not cancel the underlying wait.
pub struct AsyncResult {
    task_id: String,
    backend: Arc<dyn Backend>,
    outcome: Shared<BoxFuture<'static, std::result::Result<ResultEnvelope, TaskError>>>,
}

impl AsyncResult {
    pub(crate) fn new(task_id: String, backend: Arc<dyn Backend>) -> Self {
        let outcome = {
            let backend = backend.clone();
            let task_id = task_id.clone();
            async move { backend.get(&task_id, None).await }.boxed().shared()
        };
        // Start pulling right away; the clone handed to the task and the one
        // kept here share a single execution.
        tokio::spawn(outcome.clone());

        Self {
            task_id,
            backend,
            outcome,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Await the full result envelope, optionally bounded by `timeout`.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<ResultEnvelope> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.outcome.clone())
                .await
                .map_err(|_| {
                    TaskError::Timeout(format!(
                        "No result for task {} within {:?}",
                        self.task_id, limit
                    ))
                })?,
            None => self.outcome.clone().await,
        }
    }

    /// Await the task's return value (the envelope's `result` field).
    pub async fn get(&self, timeout: Option<Duration>) -> Result<serde_json::Value> {
        Ok(self.wait(timeout).await?.result)
    }

    /// Await the return value decoded into a caller-chosen type.
    pub async fn get_as<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T> {
        self.wait(timeout).await?.decode()
    }

    /// Discard the stored result from the backend.
    pub async fn delete(&self) -> Result<String> {
        self.backend.delete(&self.task_id).await
    }
}
