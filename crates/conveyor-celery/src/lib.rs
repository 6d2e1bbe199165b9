//! conveyor-celery: Celery protocol v2 task publishing client
//!
//! Submits tasks into a Celery-compatible worker pool over AMQP (RabbitMQ)
//! or Redis and collects their results without polling, via Redis pub/sub or
//! a per-client RabbitMQ reply queue.
//!
//! ```rust,ignore
//! use conveyor_celery::{ApplyOptions, Client, ClientConfig};
//!
//! let config = ClientConfig::new("amqp://localhost")
//!     .with_result_backend("redis://localhost");
//! let client = Client::connect(config).await?;
//!
//! let add = client.create_task("tasks.add");
//! let result = add.apply_async(
//!     ApplyOptions::new().with_args(serde_json::json!([10, 15])),
//! )?;
//! assert_eq!(result.get_as::<i64>(None).await?, 25);
//! ```

pub mod backend;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod packer;
pub mod result;
pub mod state;
pub mod task;
pub mod uri;

// Re-exports
pub use backend::{
    Backend, DisabledBackend, RedisResultBackend, RedisResultBackendConfig, RpcBackend,
    RpcBackendConfig,
};
pub use broker::{
    AmqpBroker, AmqpBrokerConfig, Broker, FailoverStrategy, RedisBroker, RedisBrokerConfig,
    RoundRobin,
};
pub use client::Client;
pub use config::{ApplyOptions, ClientConfig, DeliveryMode};
pub use error::{Result, TaskError};
pub use message::{DeliveryInfo, TaskEnvelope, TaskHeaders, TaskProperties};
pub use packer::{Compression, Packer, Serializer};
pub use result::AsyncResult;
pub use state::{ResultEnvelope, TaskStatus};
pub use task::Task;
pub use uri::{rpc_to_amqp, transport_for, TransportKind};
