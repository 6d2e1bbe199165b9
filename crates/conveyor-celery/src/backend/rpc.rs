//! RabbitMQ RPC result backend implementation
//!
//! Each client owns one reply queue, named by its app id. Workers publish
//! results there with the task id as correlation id; a no-ack consumer
//! dispatches deliveries into the keyed future map, where callers wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_sync::{FutureMap, Pool};
use futures::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::broker::amqp::{AmqpBroker, ChannelManager};
use crate::state::ResultEnvelope;
use crate::{Result, TaskError};

/// RPC backend configuration
#[derive(Debug, Clone)]
pub struct RpcBackendConfig {
    /// AMQP URL (e.g., "amqp://localhost:5672")
    pub url: String,
    /// Name of this client's reply queue; one per client, typically the
    /// app id.
    pub reply_queue: String,
    /// Channel pool size
    pub pool_size: usize,
}

impl Default for RpcBackendConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost".to_string(),
            reply_queue: String::new(),
            pool_size: 2,
        }
    }
}

/// RabbitMQ RPC result backend.
pub struct RpcBackend {
    config: RpcBackendConfig,
    connection: Arc<Connection>,
    channels: Pool<ChannelManager>,
    /// Channel the reply consumer lives on; held out of the pool for the
    /// backend's lifetime.
    consumer_channel: Channel,
    consumer_tag: Mutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// correlation id -> raw reply payload.
    replies: FutureMap<String, String>,
    closing: Arc<AtomicBool>,
}

impl std::fmt::Debug for RpcBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcBackend")
            .field("config", &self.config)
            .finish()
    }
}

impl RpcBackend {
    /// Connect to RabbitMQ, assert the reply queue, and start consuming.
    pub async fn connect(config: RpcBackendConfig) -> Result<Self> {
        if config.reply_queue.is_empty() {
            return Err(TaskError::Configuration(
                "RPC backend needs a reply queue name".to_string(),
            ));
        }

        info!(url = %config.url, reply_queue = %config.reply_queue, "Connecting RPC backend");
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to connect to AMQP: {}", e)))?;
        let connection = Arc::new(connection);
        let channels = Pool::new(ChannelManager::new(connection.clone()), config.pool_size);

        let consumer_channel = connection
            .create_channel()
            .await
            .map_err(|e| TaskError::Broker(format!("Failed to open channel: {}", e)))?;
        AmqpBroker::assert_route(&consumer_channel, "", &config.reply_queue).await?;

        let mut consumer = consumer_channel
            .basic_consume(
                &config.reply_queue,
                &format!("{}-reply", config.reply_queue),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TaskError::Backend(format!("Failed to start consumer: {}", e)))?;
        let consumer_tag = consumer.tag().to_string();

        let replies: FutureMap<String, String> = FutureMap::new();
        let map = replies.clone();
        let closing = Arc::new(AtomicBool::new(false));
        let closing_flag = closing.clone();
        let reader = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let Some(correlation_id) = delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| id.as_str().to_string())
                        else {
                            warn!("Reply without correlation id dropped");
                            continue;
                        };
                        match String::from_utf8(delivery.data) {
                            Ok(payload) => {
                                debug!(task_id = %correlation_id, "Reply received");
                                map.resolve(correlation_id, payload);
                            }
                            Err(e) => {
                                warn!(task_id = %correlation_id, error = %e, "Undecodable reply")
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Reply consumer failed");
                        break;
                    }
                }
            }
            // The server revoked the consumer (or the connection died); every
            // parked caller has to hear about it. A local close already
            // rejected them with its own reason.
            if !closing_flag.load(Ordering::SeqCst) {
                let rejected = map.reject_all("RabbitMQ cancelled consumer");
                if rejected > 0 {
                    warn!(rejected = rejected, "Reply consumer cancelled by server");
                }
            }
        });

        Ok(Self {
            config,
            connection,
            channels,
            consumer_channel,
            consumer_tag: Mutex::new(Some(consumer_tag)),
            reader: Mutex::new(Some(reader)),
            replies,
            closing,
        })
    }
}

#[async_trait]
impl Backend for RpcBackend {
    async fn put(&self, envelope: &ResultEnvelope) -> Result<String> {
        let payload = serde_json::to_string(envelope)?;
        let channel = self.channels.acquire().await?;

        AmqpBroker::assert_route(&channel, "", &self.config.reply_queue).await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".to_string().into())
            .with_content_encoding("utf-8".to_string().into())
            .with_correlation_id(envelope.task_id.clone().into())
            .with_delivery_mode(1)
            .with_priority(0);

        channel
            .basic_publish(
                "",
                &self.config.reply_queue,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                properties,
            )
            .await
            .map_err(|e| TaskError::Backend(format!("Failed to publish reply: {}", e)))?
            .await
            .map_err(|e| TaskError::Backend(format!("Reply not confirmed: {}", e)))?;

        debug!(task_id = %envelope.task_id, "Reply published");
        Ok("flushed to write buffer".to_string())
    }

    async fn get(&self, task_id: &str, timeout: Option<Duration>) -> Result<ResultEnvelope> {
        let wait = self.replies.get(task_id.to_string());
        let payload = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                TaskError::Timeout(format!("No result for task {} within {:?}", task_id, limit))
            })??,
            None => wait.await?,
        };
        serde_json::from_str(&payload)
            .map_err(|e| TaskError::Deserialization(format!("Invalid reply payload: {}", e)))
    }

    async fn delete(&self, task_id: &str) -> Result<String> {
        // Only the local dispatch table is cleaned up; the reply queue
        // expires on the server by itself.
        if self.replies.delete(&task_id.to_string()) {
            Ok("deleted".to_string())
        } else {
            Ok("no result found".to_string())
        }
    }

    async fn close(&self) -> Result<()> {
        info!(reply_queue = %self.config.reply_queue, "Closing RPC backend");
        self.closing.store(true, Ordering::SeqCst);
        self.replies.reject_all("disconnecting");

        if let Some(tag) = self.consumer_tag.lock().await.take() {
            self.consumer_channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
                .map_err(|e| TaskError::Backend(format!("Failed to cancel consumer: {}", e)))?;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.consumer_channel
            .close(200, "client shutdown")
            .await
            .map_err(|e| TaskError::Backend(format!("Failed to close channel: {}", e)))?;
        self.channels.drain_all().await?;
        self.connection
            .close(200, "client shutdown")
            .await
            .map_err(|e| TaskError::Backend(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }

    fn uri(&self) -> Result<String> {
        Err(TaskError::NotSupported(
            "RPC backend cannot reconstruct a connection URI".to_string(),
        ))
    }
}
