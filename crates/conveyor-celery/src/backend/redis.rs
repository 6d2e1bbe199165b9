//! Redis result backend implementation
//!
//! Results live under `celery-task-meta-<task id>` with a 24 hour TTL and are
//! announced on a pub/sub channel of the same name. A dedicated subscriber
//! connection pattern-subscribes to all result channels and settles the keyed
//! future map as messages arrive, so `get` never has to poll: a result that
//! was stored before the subscription saw it is recovered through a one-shot
//! `GET` fallback instead.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_sync::{FutureMap, Pool};
use futures::StreamExt;
use once_cell::sync::Lazy;
use redis::aio::PubSubSink;
use redis::AsyncCommands;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::Backend;
use crate::broker::redis::RedisConnectionManager;
use crate::state::{ResultEnvelope, TaskStatus};
use crate::{Result, TaskError};

/// Prefix of every result key and pub/sub channel.
const META_PREFIX: &str = "celery-task-meta-";

/// Result channels carry the task id after the prefix; anything else on the
/// pattern is noise and gets dropped.
static META_CHANNEL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^celery-task-meta-([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-4[0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12})$",
    )
    .unwrap()
});

/// Redis result backend configuration
#[derive(Debug, Clone)]
pub struct RedisResultBackendConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// TTL applied to stored results
    pub result_ttl: Duration,
}

impl Default for RedisResultBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 2,
            result_ttl: Duration::from_secs(86400),
        }
    }
}

/// Redis result backend.
pub struct RedisResultBackend {
    config: RedisResultBackendConfig,
    connections: Pool<RedisConnectionManager>,
    /// task id -> raw result payload, fed by the subscriber.
    results: FutureMap<String, String>,
    /// Subscribe half of the dedicated pub/sub connection, kept around so
    /// close can unsubscribe.
    subscriber: Mutex<Option<PubSubSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RedisResultBackend {
    /// Connect to Redis and arm the result subscription.
    ///
    /// The `PSUBSCRIBE` handshake completes before this returns, so a later
    /// `get` can trust that anything not yet announced will either arrive on
    /// the subscription or be found by the `GET` fallback.
    pub async fn connect(config: RedisResultBackendConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting Redis result backend");
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| TaskError::Configuration(format!("Invalid Redis URL: {}", e)))?;
        let connections =
            Pool::new(RedisConnectionManager::new(client.clone()), config.pool_size);

        let results: FutureMap<String, String> =
            FutureMap::with_ttl(Duration::from_millis(86_400_000));

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to open subscriber: {}", e)))?;
        let (mut sink, mut stream) = pubsub.split();
        sink.psubscribe(format!("{}*", META_PREFIX))
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to subscribe: {}", e)))?;

        let map = results.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let channel = message.get_channel_name().to_string();
                let Some(task_id) = parse_meta_channel(&channel) else {
                    continue;
                };
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        debug!(task_id = %task_id, "Result announced");
                        map.resolve(task_id, payload);
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Undecodable result message")
                    }
                }
            }
            debug!("Result subscription ended");
        });

        Ok(Self {
            config,
            connections,
            results,
            subscriber: Mutex::new(Some(sink)),
            reader: Mutex::new(Some(reader)),
        })
    }

    fn meta_key(task_id: &str) -> String {
        format!("{}{}", META_PREFIX, task_id)
    }

    /// Raw payload for `task_id`: the future map if armed, otherwise a
    /// stored-before-subscribe recovery via `GET`, otherwise back to the map.
    async fn fetch(&self, task_id: &str) -> Result<String> {
        if self.results.has(&task_id.to_string()) {
            return self
                .results
                .get(task_id.to_string())
                .await
                .map_err(TaskError::from);
        }

        {
            let mut connection = self.connections.acquire().await?;
            let stored: Option<String> = connection
                .get(Self::meta_key(task_id))
                .await
                .map_err(|e| TaskError::Backend(format!("Failed to read result: {}", e)))?;
            if let Some(payload) = stored {
                if let Ok(envelope) = serde_json::from_str::<ResultEnvelope>(&payload) {
                    if envelope.status == TaskStatus::Success {
                        debug!(task_id = %task_id, "Result recovered from store");
                        return Ok(payload);
                    }
                }
            }
        }

        // Not finished yet; park on the subscription.
        self.results
            .get(task_id.to_string())
            .await
            .map_err(TaskError::from)
    }
}

#[async_trait]
impl Backend for RedisResultBackend {
    async fn put(&self, envelope: &ResultEnvelope) -> Result<String> {
        let payload = serde_json::to_string(envelope)?;
        let key = Self::meta_key(&envelope.task_id);

        let mut connection = self.connections.acquire().await?;
        // Store and announce in one transaction so subscribers and pollers
        // cannot observe one without the other.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SETEX")
            .arg(&key)
            .arg(self.config.result_ttl.as_secs())
            .arg(&payload)
            .cmd("PUBLISH")
            .arg(&key)
            .arg(&payload);
        let (stored, receivers): (String, i64) = pipe
            .query_async(&mut *connection)
            .await
            .map_err(|e| TaskError::Backend(format!("Failed to store result: {}", e)))?;

        debug!(
            task_id = %envelope.task_id,
            status = ?envelope.status,
            receivers = receivers,
            "Result stored"
        );
        Ok(stored)
    }

    async fn get(&self, task_id: &str, timeout: Option<Duration>) -> Result<ResultEnvelope> {
        let payload = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.fetch(task_id))
                .await
                .map_err(|_| {
                    TaskError::Timeout(format!(
                        "No result for task {} within {:?}",
                        task_id, limit
                    ))
                })??,
            None => self.fetch(task_id).await?,
        };
        serde_json::from_str(&payload)
            .map_err(|e| TaskError::Deserialization(format!("Invalid result payload: {}", e)))
    }

    async fn delete(&self, task_id: &str) -> Result<String> {
        self.results.delete(&task_id.to_string());

        let mut connection = self.connections.acquire().await?;
        let removed: i64 = connection
            .del(Self::meta_key(task_id))
            .await
            .map_err(|e| TaskError::Backend(format!("Failed to delete result: {}", e)))?;
        debug!(task_id = %task_id, removed = removed, "Result deleted");
        Ok(removed.to_string())
    }

    async fn close(&self) -> Result<()> {
        info!(url = %self.config.url, "Closing Redis result backend");
        if let Some(mut sink) = self.subscriber.lock().await.take() {
            sink.punsubscribe(format!("{}*", META_PREFIX))
                .await
                .map_err(|e| TaskError::Backend(format!("Failed to unsubscribe: {}", e)))?;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.results.reject_all("disconnecting");
        self.connections.drain_all().await?;
        Ok(())
    }

    fn uri(&self) -> Result<String> {
        let url = Url::parse(&self.config.url)
            .map_err(|e| TaskError::Configuration(format!("Invalid Redis URL: {}", e)))?;
        Ok(format!(
            "{}://{}:{}",
            url.scheme(),
            url.host_str().unwrap_or("localhost"),
            url.port().unwrap_or(6379)
        ))
    }
}

/// Extract the task id from a result channel name.
fn parse_meta_channel(channel: &str) -> Option<String> {
    META_CHANNEL_REGEX
        .captures(channel)
        .map(|captures| captures[1].to_string())
}
