//! Message broker implementations
//!
//! Brokers transport task envelopes to workers. Publishing goes through a
//! pluggable failover strategy: when a publish fails, the envelope builder
//! asks the strategy for the next broker and retries there.

pub mod amqp;
pub mod redis;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::TaskEnvelope;
use crate::Result;

pub use amqp::{AmqpBroker, AmqpBrokerConfig};
pub use redis::{RedisBroker, RedisBrokerConfig};

/// Trait for task message brokers.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish a task envelope to its routing key. Returns the transport's
    /// acknowledgement string.
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<String>;

    /// Gracefully shut down connections and channels.
    async fn close(&self) -> Result<()>;
}

/// Picks which broker handles the next publish after a failure.
pub trait FailoverStrategy: Send + Sync + 'static {
    fn select(&self, brokers: &[Arc<dyn Broker>]) -> Arc<dyn Broker>;
}

/// Cycles through the broker list with an independent counter: call `i`
/// yields broker `i mod N`.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FailoverStrategy for RoundRobin {
    fn select(&self, brokers: &[Arc<dyn Broker>]) -> Arc<dyn Broker> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % brokers.len();
        brokers[index].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubBroker(usize);

    #[async_trait]
    impl Broker for StubBroker {
        async fn publish(&self, _envelope: &TaskEnvelope) -> Result<String> {
            Ok(self.0.to_string())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let brokers: Vec<Arc<dyn Broker>> = (0..3)
            .map(|i| Arc::new(StubBroker(i)) as Arc<dyn Broker>)
            .collect();
        let strategy = RoundRobin::new();

        let mut picks = Vec::new();
        for _ in 0..7 {
            let broker = strategy.select(&brokers);
            // Identify the pick by pointer identity against the list.
            let index = brokers
                .iter()
                .position(|b| Arc::ptr_eq(b, &broker))
                .unwrap();
            picks.push(index);
        }
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_round_robin_single_broker() {
        let brokers: Vec<Arc<dyn Broker>> = vec![Arc::new(StubBroker(0))];
        let strategy = RoundRobin::new();
        for _ in 0..3 {
            assert!(Arc::ptr_eq(&strategy.select(&brokers), &brokers[0]));
        }
    }
}
