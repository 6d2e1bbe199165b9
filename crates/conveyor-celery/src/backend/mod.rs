//! Result backend implementations
//!
//! Backends store results published by workers and deliver them to waiting
//! callers without polling: the Redis backend listens on pub/sub, the RPC
//! backend consumes a per-client reply queue.

pub mod redis;
pub mod rpc;

use std::time::Duration;

use async_trait::async_trait;

use crate::state::ResultEnvelope;
use crate::{Result, TaskError};

pub use redis::{RedisResultBackend, RedisResultBackendConfig};
pub use rpc::{RpcBackend, RpcBackendConfig};

/// Trait for result backend implementations.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Store and announce a result. Returns the transport's reply.
    async fn put(&self, envelope: &ResultEnvelope) -> Result<String>;

    /// Wait for the result of `task_id`, optionally bounded by `timeout`.
    async fn get(&self, task_id: &str, timeout: Option<Duration>) -> Result<ResultEnvelope>;

    /// Discard the stored result. Returns the transport's reply.
    async fn delete(&self, task_id: &str) -> Result<String>;

    /// Shut down, turning away every caller still waiting on a result.
    async fn close(&self) -> Result<()>;

    /// Reconstruct the configured connection URI (lossy).
    fn uri(&self) -> Result<String>;
}

/// Backend used for tasks invoked with `ignore_result`: stores nothing and
/// turns every `get` away immediately.
#[derive(Debug, Default)]
pub struct DisabledBackend;

#[async_trait]
impl Backend for DisabledBackend {
    async fn put(&self, _envelope: &ResultEnvelope) -> Result<String> {
        Ok("ignored".to_string())
    }

    async fn get(&self, _task_id: &str, _timeout: Option<Duration>) -> Result<ResultEnvelope> {
        Err(TaskError::ResultIgnored)
    }

    async fn delete(&self, _task_id: &str) -> Result<String> {
        Ok("no result found".to_string())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn uri(&self) -> Result<String> {
        Err(TaskError::NotSupported(
            "disabled backend has no connection URI".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_backend_rejects_get() {
        let backend = DisabledBackend;
        let err = backend.get("any-task", None).await.unwrap_err();
        assert!(matches!(err, TaskError::ResultIgnored));
        assert_eq!(backend.delete("any-task").await.unwrap(), "no result found");
        assert!(backend.uri().is_err());
    }
}
