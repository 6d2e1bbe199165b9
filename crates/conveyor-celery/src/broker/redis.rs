//! Redis broker implementation
//!
//! Celery's Redis transport is a plain list: the client LPUSHes the JSON
//! envelope onto the queue key and workers BRPOP from the other end.

use async_trait::async_trait;
use conveyor_sync::{Manager, Pool};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::message::TaskEnvelope;
use crate::{Result, TaskError};

/// Redis broker configuration
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 2,
        }
    }
}

/// Opens multiplexed connections for the broker's pool.
pub(crate) struct RedisConnectionManager {
    client: redis::Client,
}

impl RedisConnectionManager {
    pub(crate) fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Manager for RedisConnectionManager {
    type Resource = MultiplexedConnection;
    type Error = TaskError;
    type DrainResponse = String;

    async fn create(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to connect to Redis: {}", e)))
    }

    async fn destroy(&self, connection: MultiplexedConnection) -> Result<String> {
        // Multiplexed connections shut down when the last handle is dropped.
        drop(connection);
        Ok("disconnected".to_string())
    }
}

/// Redis list broker.
pub struct RedisBroker {
    config: RedisBrokerConfig,
    connections: Pool<RedisConnectionManager>,
}

impl RedisBroker {
    /// Connect to Redis and set up the connection pool.
    pub async fn connect(config: RedisBrokerConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting Redis broker");
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| TaskError::Configuration(format!("Invalid Redis URL: {}", e)))?;
        let connections = Pool::new(RedisConnectionManager::new(client), config.pool_size);

        // Establish one connection up front so a bad address fails here
        // rather than on the first publish.
        connections.acquire().await?;

        Ok(Self {
            config,
            connections,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<String> {
        let payload = envelope.to_json()?;
        let queue = envelope.properties.delivery_info.routing_key.clone();

        let mut connection = self.connections.acquire().await?;
        let queued: i64 = connection
            .lpush(&queue, payload)
            .await
            .map_err(|e| TaskError::Broker(format!("Failed to push task: {}", e)))?;

        debug!(
            task_id = %envelope.headers.id,
            task = %envelope.headers.task,
            queue = %queue,
            depth = queued,
            "Task pushed"
        );
        Ok(queued.to_string())
    }

    async fn close(&self) -> Result<()> {
        info!(url = %self.config.url, "Closing Redis broker");
        self.connections.drain_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RedisBrokerConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, 2);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_publish_pushes_to_queue() {
        use crate::message::{DeliveryInfo, TaskHeaders, TaskProperties};

        let broker = RedisBroker::connect(RedisBrokerConfig::default()).await.unwrap();
        let envelope = TaskEnvelope {
            headers: TaskHeaders {
                lang: "py".to_string(),
                task: "tasks.noop".to_string(),
                id: "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee".to_string(),
                root_id: "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee".to_string(),
                parent_id: None,
                group: None,
                eta: None,
                expires: None,
                retries: 0,
                timelimit: (None, None),
                origin: "1@test-host".to_string(),
                compression: None,
            },
            properties: TaskProperties {
                correlation_id: "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee".to_string(),
                reply_to: "test-app".to_string(),
                delivery_mode: 2,
                delivery_info: DeliveryInfo {
                    exchange: String::new(),
                    routing_key: "celery".to_string(),
                },
                priority: 0,
                body_encoding: "utf-8".to_string(),
            },
            body: "[[],{},{\"callbacks\":null,\"chain\":null,\"chord\":null,\"errbacks\":null}]"
                .to_string(),
            content_type: "application/json".to_string(),
            content_encoding: "utf-8".to_string(),
        };

        let depth: i64 = broker.publish(&envelope).await.unwrap().parse().unwrap();
        assert!(depth >= 1);
        broker.close().await.unwrap();
    }
}
