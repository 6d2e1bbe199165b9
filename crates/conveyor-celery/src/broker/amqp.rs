//! AMQP 0-9-1 (RabbitMQ) broker implementation

use std::sync::Arc;

use async_trait::async_trait;
use conveyor_sync::{Manager, Pool};
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use crate::broker::Broker;
use crate::message::{TaskEnvelope, TaskHeaders};
use crate::{Result, TaskError};

/// Queues expire server-side after a day without consumers.
pub(crate) const QUEUE_EXPIRES_MS: i64 = 86_400_000;

/// AMQP broker configuration
#[derive(Debug, Clone)]
pub struct AmqpBrokerConfig {
    /// AMQP URL (e.g., "amqp://localhost:5672")
    pub url: String,
    /// Channel pool size
    pub pool_size: usize,
}

impl Default for AmqpBrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost".to_string(),
            pool_size: 2,
        }
    }
}

/// Opens and closes channels on a shared connection for the channel pool.
pub(crate) struct ChannelManager {
    connection: Arc<Connection>,
}

impl ChannelManager {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Manager for ChannelManager {
    type Resource = Channel;
    type Error = TaskError;
    type DrainResponse = String;

    async fn create(&self) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| TaskError::Broker(format!("Failed to open channel: {}", e)))
    }

    async fn destroy(&self, channel: Channel) -> Result<String> {
        channel
            .close(200, "client shutdown")
            .await
            .map_err(|e| TaskError::Broker(format!("Failed to close channel: {}", e)))?;
        Ok("channel closed".to_string())
    }
}

/// AMQP broker: publishes task envelopes to the default exchange with the
/// queue asserted on every publish, over a small channel pool.
pub struct AmqpBroker {
    config: AmqpBrokerConfig,
    connection: Arc<Connection>,
    channels: Pool<ChannelManager>,
}

impl AmqpBroker {
    /// Connect to RabbitMQ and set up the channel pool.
    pub async fn connect(config: AmqpBrokerConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting AMQP broker");
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to connect to AMQP: {}", e)))?;
        let connection = Arc::new(connection);
        let channels = Pool::new(ChannelManager::new(connection.clone()), config.pool_size);

        Ok(Self {
            config,
            connection,
            channels,
        })
    }

    /// Assert the destination queue and, for a named exchange, the exchange.
    /// The default exchange ("") must never be redeclared.
    pub(crate) async fn assert_route(
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        let mut arguments = FieldTable::default();
        arguments.insert("x-expires".into(), AMQPValue::LongLongInt(QUEUE_EXPIRES_MS));
        channel
            .queue_declare(
                routing_key,
                QueueDeclareOptions {
                    durable: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| TaskError::Broker(format!("Failed to declare queue: {}", e)))?;

        if !exchange.is_empty() {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TaskError::Broker(format!("Failed to declare exchange: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<String> {
        let channel = self.channels.acquire().await?;
        let exchange = envelope.properties.delivery_info.exchange.clone();
        let routing_key = envelope.properties.delivery_info.routing_key.clone();

        Self::assert_route(&channel, &exchange, &routing_key).await?;

        let properties = BasicProperties::default()
            .with_content_type(envelope.content_type.clone().into())
            .with_content_encoding(envelope.content_encoding.clone().into())
            .with_correlation_id(envelope.properties.correlation_id.clone().into())
            .with_delivery_mode(envelope.properties.delivery_mode)
            .with_priority(envelope.properties.priority)
            .with_reply_to(envelope.properties.reply_to.clone().into())
            .with_headers(headers_table(&envelope.headers)?);

        debug!(
            task_id = %envelope.headers.id,
            task = %envelope.headers.task,
            routing_key = %routing_key,
            "Publishing task"
        );

        // Both awaits apply write backpressure: the publish future completes
        // once the frames are accepted into the socket write buffer, the
        // confirm future once the broker has taken the message.
        channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                envelope.body.as_bytes(),
                properties,
            )
            .await
            .map_err(|e| TaskError::Broker(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| TaskError::Broker(format!("Publish not confirmed: {}", e)))?;

        Ok("flushed to write buffer".to_string())
    }

    async fn close(&self) -> Result<()> {
        info!(url = %self.config.url, "Closing AMQP broker");
        self.channels.drain_all().await?;
        self.connection
            .close(200, "client shutdown")
            .await
            .map_err(|e| TaskError::Broker(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}

/// Render the task headers as an AMQP field table.
pub(crate) fn headers_table(headers: &TaskHeaders) -> Result<FieldTable> {
    let value = serde_json::to_value(headers)?;
    match json_to_amqp(&value) {
        AMQPValue::FieldTable(table) => Ok(table),
        _ => Err(TaskError::Internal(
            "Task headers did not serialize to a map".to_string(),
        )),
    }
}

fn json_to_amqp(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Null => AMQPValue::Void,
        serde_json::Value::Bool(flag) => AMQPValue::Boolean(*flag),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(integer) => AMQPValue::LongLongInt(integer),
            None => AMQPValue::Double(number.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(text) => AMQPValue::LongString(text.clone().into()),
        serde_json::Value::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(json_to_amqp(item));
            }
            AMQPValue::FieldArray(array)
        }
        serde_json::Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, item) in map {
                table.insert(key.clone().into(), json_to_amqp(item));
            }
            AMQPValue::FieldTable(table)
        }
    }
}
