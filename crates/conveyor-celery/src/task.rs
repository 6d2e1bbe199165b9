//! Task invocation: envelope building and publish with failover

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{Backend, DisabledBackend};
use crate::broker::{Broker, FailoverStrategy};
use crate::config::{ApplyOptions, ClientConfig};
use crate::message::{DeliveryInfo, TaskEnvelope, TaskHeaders, TaskProperties};
use crate::packer::Packer;
use crate::result::AsyncResult;
use crate::Result;

/// Shared client internals: brokers, backend, and the failover pointer.
pub(crate) struct ClientState {
    pub(crate) config: ClientConfig,
    /// Identifies this client on the wire; reply queues and `reply_to` use it.
    pub(crate) app_id: String,
    pub(crate) brokers: Vec<Arc<dyn Broker>>,
    /// Broker the next publish goes to; replaced on publish failure.
    pub(crate) current_broker: Mutex<Arc<dyn Broker>>,
    pub(crate) strategy: Arc<dyn FailoverStrategy>,
    pub(crate) backend: Arc<dyn Backend>,
}

/// A named task bound to a client, ready to be invoked.
pub struct Task {
    name: String,
    state: Arc<ClientState>,
}

impl Task {
    pub(crate) fn new(name: String, state: Arc<ClientState>) -> Self {
        Self { name, state }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit one invocation of this task.
    ///
    /// The result handle starts listening before the message leaves, so a
    /// very fast worker cannot win the race against its own reply. The
    /// publish itself runs in the background and keeps failing over between
    /// brokers until one accepts it; callers bound their patience through
    /// `expires` and result timeouts.
    pub fn apply_async(&self, options: ApplyOptions) -> Result<AsyncResult> {
        let task_id = Uuid::new_v4().to_string();

        let backend: Arc<dyn Backend> = if options.ignore_result {
            Arc::new(DisabledBackend)
        } else {
            self.state.backend.clone()
        };
        let handle = AsyncResult::new(task_id.clone(), backend);

        let envelope = self.build_envelope(&task_id, &options)?;
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut broker = state.current_broker.lock().clone();
            loop {
                match broker.publish(&envelope).await {
                    Ok(response) => {
                        debug!(
                            task_id = %envelope.headers.id,
                            task = %envelope.headers.task,
                            response = %response,
                            "Task published"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(
                            task_id = %envelope.headers.id,
                            error = %e,
                            "Publish failed, failing over"
                        );
                        broker = state.strategy.select(&state.brokers);
                        *state.current_broker.lock() = broker.clone();
                    }
                }
            }
        });

        Ok(handle)
    }

    fn build_envelope(&self, task_id: &str, options: &ApplyOptions) -> Result<TaskEnvelope> {
        let config = &self.state.config;
        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| config.queue.clone());

        let args = match &options.args {
            serde_json::Value::Null => serde_json::json!([]),
            other => other.clone(),
        };
        let kwargs = match &options.kwargs {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };

        let packer = Packer::new(options.serializer, options.compression);
        let body = packer.pack(&serde_json::json!([
            args,
            kwargs,
            {
                "callbacks": null,
                "chain": null,
                "chord": null,
                "errbacks": null
            }
        ]))?;

        let headers = TaskHeaders {
            lang: "py".to_string(),
            task: self.name.clone(),
            id: task_id.to_string(),
            root_id: task_id.to_string(),
            parent_id: None,
            group: None,
            eta: options.eta.map(|eta| eta.to_rfc3339()),
            expires: options.expires.map(|expires| expires.to_rfc3339()),
            retries: 0,
            timelimit: (config.soft_time_limit, config.hard_time_limit),
            origin: origin(),
            compression: packer.mime().map(String::from),
        };
        let properties = TaskProperties {
            correlation_id: task_id.to_string(),
            reply_to: self.state.app_id.clone(),
            delivery_mode: config.delivery_mode.wire_value(),
            delivery_info: DeliveryInfo {
                exchange: String::new(),
                routing_key: queue,
            },
            priority: options.priority,
            body_encoding: packer.body_encoding().to_string(),
        };

        Ok(TaskEnvelope {
            headers,
            properties,
            body,
            content_type: packer.content_type().to_string(),
            content_encoding: "utf-8".to_string(),
        })
    }
}

/// `<pid>@<hostname>` of the publishing process.
fn origin() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", std::process::id(), host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RoundRobin;
    use crate::config::DeliveryMode;
    use crate::packer::{Compression, Serializer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct RecordingBroker {
        publishes: AtomicUsize,
        fail_first: usize,
    }

    impl RecordingBroker {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                publishes: AtomicUsize::new(0),
                fail_first,
            })
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn publish(&self, _envelope: &TaskEnvelope) -> Result<String> {
            let attempt = self.publishes.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                Err(crate::TaskError::Broker("connection refused".to_string()))
            } else {
                Ok("flushed to write buffer".to_string())
            }
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_state(brokers: Vec<Arc<dyn Broker>>, config: ClientConfig) -> Arc<ClientState> {
        let strategy: Arc<dyn FailoverStrategy> = Arc::new(RoundRobin::new());
        let current = strategy.select(&brokers);
        Arc::new(ClientState {
            config,
            app_id: "aaaaaaaa-0000-4000-8000-000000000000".to_string(),
            brokers,
            current_broker: Mutex::new(current),
            strategy,
            backend: Arc::new(DisabledBackend),
        })
    }

    fn test_task(config: ClientConfig) -> (Task, Arc<RecordingBroker>) {
        let broker = RecordingBroker::new(0);
        let task = Task::new(
            "tasks.add".to_string(),
            test_state(vec![broker.clone()], config),
        );
        (task, broker)
    }

    #[test]
    fn test_envelope_identity_invariants() {
        let (task, _) = test_task(ClientConfig::default());
        let options = ApplyOptions::new().with_args(serde_json::json!([10, 15]));
        let envelope = task
            .build_envelope("11111111-2222-4333-8444-555555555555", &options)
            .unwrap();

        assert_eq!(envelope.headers.id, envelope.properties.correlation_id);
        assert_eq!(envelope.headers.root_id, envelope.headers.id);
        assert!(envelope.headers.parent_id.is_none());
        assert_eq!(envelope.headers.lang, "py");
        assert_eq!(envelope.headers.task, "tasks.add");
        assert_eq!(envelope.properties.reply_to, task.state.app_id);
        assert_eq!(envelope.properties.delivery_mode, 2);
        assert_eq!(envelope.properties.delivery_info.exchange, "");
        assert_eq!(envelope.properties.delivery_info.routing_key, "celery");
        assert_eq!(envelope.properties.priority, 0);
        assert_eq!(envelope.content_encoding, "utf-8");
        assert_eq!(envelope.content_type, "application/json");
        assert_eq!(envelope.properties.body_encoding, "utf-8");
        assert!(envelope.headers.compression.is_none());
        assert!(envelope.headers.origin.contains('@'));
    }

    #[test]
    fn test_envelope_body_shape() {
        let (task, _) = test_task(ClientConfig::default());
        let options = ApplyOptions::new()
            .with_args(serde_json::json!([10, 15]))
            .with_kwargs(serde_json::json!({"carry": 0}));
        let envelope = task
            .build_envelope("11111111-2222-4333-8444-555555555555", &options)
            .unwrap();

        let body: serde_json::Value = serde_json::from_str(&envelope.body).unwrap();
        assert_eq!(
            body,
            serde_json::json!([
                [10, 15],
                {"carry": 0},
                {"callbacks": null, "chain": null, "chord": null, "errbacks": null}
            ])
        );
    }

    #[test]
    fn test_envelope_null_args_become_empty() {
        let (task, _) = test_task(ClientConfig::default());
        let envelope = task
            .build_envelope("11111111-2222-4333-8444-555555555555", &ApplyOptions::new())
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&envelope.body).unwrap();
        assert_eq!(body[0], serde_json::json!([]));
        assert_eq!(body[1], serde_json::json!({}));
    }

    #[test]
    fn test_envelope_compression_and_encoding() {
        let (task, _) = test_task(ClientConfig::default());
        for compression in [Compression::Zlib, Compression::Gzip] {
            let options = ApplyOptions::new().with_compression(compression);
            let envelope = task
                .build_envelope("11111111-2222-4333-8444-555555555555", &options)
                .unwrap();
            assert_eq!(
                envelope.headers.compression.as_deref(),
                Some("application/x-gzip")
            );
            assert_eq!(envelope.properties.body_encoding, "base64");
            // The body unpacks with a zlib packer whichever label was asked for.
            let packer = Packer::new(Serializer::Json, Compression::Zlib);
            let body = packer.unpack(&envelope.body).unwrap();
            assert_eq!(body[0], serde_json::json!([]));
        }
    }

    #[test]
    fn test_envelope_option_overrides() {
        let config = ClientConfig::default()
            .with_delivery_mode(DeliveryMode::Transient)
            .with_soft_time_limit(10.0)
            .with_hard_time_limit(60.0);
        let (task, _) = test_task(config);

        let eta = chrono::Utc::now() + chrono::Duration::minutes(5);
        let options = ApplyOptions::new()
            .with_queue("priority")
            .with_priority(9)
            .with_eta(eta)
            .with_serializer(Serializer::Yaml);
        let envelope = task
            .build_envelope("11111111-2222-4333-8444-555555555555", &options)
            .unwrap();

        assert_eq!(envelope.properties.delivery_mode, 1);
        assert_eq!(envelope.properties.delivery_info.routing_key, "priority");
        assert_eq!(envelope.properties.priority, 9);
        assert_eq!(envelope.headers.timelimit, (Some(10.0), Some(60.0)));
        assert_eq!(envelope.headers.eta.as_deref(), Some(eta.to_rfc3339().as_str()));
        assert!(envelope.headers.expires.is_none());
        assert_eq!(envelope.content_type, "application/x-yaml");
    }

    #[tokio::test]
    async fn test_apply_async_publishes_in_background() {
        let (task, broker) = test_task(ClientConfig::default());
        let handle = task.apply_async(ApplyOptions::new()).unwrap();
        assert!(uuid::Uuid::parse_str(handle.task_id()).is_ok());

        // apply_async returns before the publish lands; wait for the spawn.
        for _ in 0..100 {
            if broker.publishes.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.publishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_apply_async_fails_over_until_accepted() {
        let flaky = RecordingBroker::new(2);
        let steady = RecordingBroker::new(0);
        let brokers: Vec<Arc<dyn Broker>> = vec![flaky.clone(), steady.clone()];
        let task = Task::new(
            "tasks.add".to_string(),
            test_state(brokers, ClientConfig::default()),
        );

        task.apply_async(ApplyOptions::new()).unwrap();
        for _ in 0..100 {
            if steady.publishes.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // First attempt failed on the flaky broker, the strategy moved on,
        // and the message landed on the steady one.
        assert!(flaky.publishes.load(Ordering::SeqCst) >= 1);
        assert_eq!(steady.publishes.load(Ordering::SeqCst), 1);
    }
}
