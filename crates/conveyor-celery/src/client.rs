//! Client façade wiring brokers, backend, and tasks together

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::backend::{
    Backend, DisabledBackend, RedisResultBackend, RedisResultBackendConfig, RpcBackend,
    RpcBackendConfig,
};
use crate::broker::{
    AmqpBroker, AmqpBrokerConfig, Broker, FailoverStrategy, RedisBroker, RedisBrokerConfig,
    RoundRobin,
};
use crate::config::ClientConfig;
use crate::task::{ClientState, Task};
use crate::uri::{rpc_to_amqp, transport_for, TransportKind};
use crate::{Result, TaskError};

/// Task publishing client.
///
/// Owns the broker connections, the result backend, and this application's
/// id (used as `reply_to` and as the RPC reply queue name). Cheap to clone;
/// clones share the same connections.
#[derive(Clone)]
pub struct Client {
    state: Arc<ClientState>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("app_id", &self.state.app_id)
            .finish()
    }
}

impl Client {
    /// Connect brokers and backend according to `config`, using round-robin
    /// failover between brokers.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::connect_with_strategy(config, Arc::new(RoundRobin::new())).await
    }

    /// Connect with a caller-supplied failover strategy.
    pub async fn connect_with_strategy(
        config: ClientConfig,
        strategy: Arc<dyn FailoverStrategy>,
    ) -> Result<Self> {
        if config.broker_urls.is_empty() {
            return Err(TaskError::Configuration(
                "At least one broker URL is required".to_string(),
            ));
        }

        let app_id = Uuid::new_v4().to_string();

        let mut brokers: Vec<Arc<dyn Broker>> = Vec::with_capacity(config.broker_urls.len());
        for url in &config.broker_urls {
            let broker: Arc<dyn Broker> = match transport_for(url)? {
                TransportKind::Amqp => Arc::new(
                    AmqpBroker::connect(AmqpBrokerConfig {
                        url: url.clone(),
                        ..Default::default()
                    })
                    .await?,
                ),
                TransportKind::Redis => Arc::new(
                    RedisBroker::connect(RedisBrokerConfig {
                        url: url.clone(),
                        ..Default::default()
                    })
                    .await?,
                ),
            };
            brokers.push(broker);
        }

        let backend: Arc<dyn Backend> = match &config.result_backend {
            None => Arc::new(DisabledBackend),
            Some(url) => match transport_for(url)? {
                TransportKind::Redis => Arc::new(
                    RedisResultBackend::connect(RedisResultBackendConfig {
                        url: url.clone(),
                        ..Default::default()
                    })
                    .await?,
                ),
                TransportKind::Amqp => Arc::new(
                    RpcBackend::connect(RpcBackendConfig {
                        url: rpc_to_amqp(url),
                        reply_queue: app_id.clone(),
                        ..Default::default()
                    })
                    .await?,
                ),
            },
        };

        let current_broker = strategy.select(&brokers);
        info!(
            app_id = %app_id,
            brokers = config.broker_urls.len(),
            backend = config.result_backend.as_deref().unwrap_or("none"),
            "Client connected"
        );

        Ok(Self {
            state: Arc::new(ClientState {
                config,
                app_id,
                brokers,
                current_broker: Mutex::new(current_broker),
                strategy,
                backend,
            }),
        })
    }

    /// This client's wire identity.
    pub fn app_id(&self) -> &str {
        &self.state.app_id
    }

    /// Handle on a named task.
    pub fn create_task(&self, name: impl Into<String>) -> Task {
        Task::new(name.into(), self.state.clone())
    }

    /// Shut down every broker and the backend. Pending result waiters are
    /// turned away; operations after close are undefined.
    pub async fn close(&self) -> Result<()> {
        for broker in &self.state.brokers {
            broker.close().await?;
        }
        self.state.backend.close().await?;
        info!(app_id = %self.state.app_id, "Client closed");
        Ok(())
    }
}
