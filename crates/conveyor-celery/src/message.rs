//! Celery protocol v2 task message format
//!
//! A task travels as a triple of headers, properties, and packed body, plus
//! the two content fields describing how the body was produced. On AMQP the
//! headers/properties map onto message attributes; on Redis the whole
//! envelope is pushed as one JSON document.

use serde::{Deserialize, Serialize};

/// Task message headers, read by the worker before deserializing the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeaders {
    /// Worker-side language; the reference worker expects "py".
    pub lang: String,
    /// Registered task name, e.g. `tasks.add`.
    pub task: String,
    /// Task id (UUID v4).
    pub id: String,
    /// Root of the workflow this task belongs to; equals `id` for a task
    /// with no parent.
    pub root_id: String,
    pub parent_id: Option<String>,
    pub group: Option<String>,
    /// Earliest execution time, ISO-8601.
    pub eta: Option<String>,
    /// Expiration time, ISO-8601.
    pub expires: Option<String>,
    pub retries: u32,
    /// `[soft, hard]` time limit in seconds.
    pub timelimit: (Option<f64>, Option<f64>),
    /// `<pid>@<hostname>` of the publishing process.
    pub origin: String,
    /// MIME token of the body compression; absent when uncompressed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
}

/// Routing information carried inside the message properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Always the default exchange ("").
    pub exchange: String,
    /// Target queue name.
    pub routing_key: String,
}

/// Task message properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProperties {
    /// Equals the task id; the RPC backend matches replies on it.
    pub correlation_id: String,
    /// The publishing application's id; the RPC backend consumes from a
    /// queue of this name.
    pub reply_to: String,
    /// 2 = persistent, 1 = transient.
    pub delivery_mode: u8,
    pub delivery_info: DeliveryInfo,
    pub priority: u8,
    /// "base64" for compressed bodies, "utf-8" otherwise.
    pub body_encoding: String,
}

/// Complete wire-level task message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub headers: TaskHeaders,
    pub properties: TaskProperties,
    pub body: String,
    /// Serializer content type (envelope-level, independent of
    /// `body_encoding`).
    #[serde(rename = "content-type")]
    pub content_type: String,
    /// Encoding of the envelope itself; always "utf-8".
    #[serde(rename = "content-encoding")]
    pub content_encoding: String,
}

impl TaskEnvelope {
    /// JSON form pushed onto Redis broker queues.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(crate::TaskError::from)
    }
}
