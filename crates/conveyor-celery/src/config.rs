//! Client configuration and per-invocation task options

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::packer::{Compression, Serializer};

/// Message durability requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Persistent,
    Transient,
}

impl DeliveryMode {
    /// Numeric value carried in the message properties.
    pub fn wire_value(&self) -> u8 {
        match self {
            Self::Persistent => 2,
            Self::Transient => 1,
        }
    }
}

/// Client-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker connection URIs; publishes fail over between them.
    pub broker_urls: Vec<String>,
    /// Result backend URI; tasks run fire-and-forget when absent.
    pub result_backend: Option<String>,
    /// Default queue tasks are routed to.
    pub queue: String,
    /// Default message durability.
    pub delivery_mode: DeliveryMode,
    /// Soft time limit in seconds (worker receives a warning).
    pub soft_time_limit: Option<f64>,
    /// Hard time limit in seconds (worker kills the task).
    pub hard_time_limit: Option<f64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_urls: vec!["amqp://localhost".to_string()],
            result_backend: None,
            queue: "celery".to_string(),
            delivery_mode: DeliveryMode::Persistent,
            soft_time_limit: None,
            hard_time_limit: None,
        }
    }
}

impl ClientConfig {
    /// Configuration with a single broker URI.
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_urls: vec![broker_url.into()],
            ..Default::default()
        }
    }

    /// Add a further broker URI for failover.
    pub fn with_broker(mut self, broker_url: impl Into<String>) -> Self {
        self.broker_urls.push(broker_url.into());
        self
    }

    pub fn with_result_backend(mut self, uri: impl Into<String>) -> Self {
        self.result_backend = Some(uri.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_soft_time_limit(mut self, seconds: f64) -> Self {
        self.soft_time_limit = Some(seconds);
        self
    }

    pub fn with_hard_time_limit(mut self, seconds: f64) -> Self {
        self.hard_time_limit = Some(seconds);
        self
    }
}

/// Options for a single task invocation.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Positional arguments (JSON array).
    pub args: serde_json::Value,
    /// Keyword arguments (JSON object).
    pub kwargs: serde_json::Value,
    /// Earliest execution time.
    pub eta: Option<DateTime<Utc>>,
    /// Expiration time.
    pub expires: Option<DateTime<Utc>>,
    /// Message priority, 0-255.
    pub priority: u8,
    pub compression: Compression,
    pub serializer: Serializer,
    /// Skip result collection entirely.
    pub ignore_result: bool,
    /// Queue override for this invocation.
    pub queue: Option<String>,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn ignore_result(mut self) -> Self {
        self.ignore_result = true;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}
