//! Broker-to-engine message bridge.
//!
//! Every delivery on the bridge queue is a JSON envelope
//! `{name, correlation_key, payload}`. Decoded envelopes are published to the
//! engine unchanged. Each delivery is acknowledged exactly once after the
//! publish attempt, whether it was malformed, rejected or published.

use crate::broker::{Broker, BrokerError, Delivery, QueueSpec, DEFAULT_PREFETCH};
use jobsync_core::BrokerEnvelope;
use jobsync_engine::EngineClient;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Errors ending the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Queue declaration failed
    #[error("Failed to declare queue {queue}: {source}")]
    Declare {
        /// Queue name
        queue: String,
        /// Broker error
        #[source]
        source: BrokerError,
    },

    /// Consumer could not be registered
    #[error("Failed to consume queue {queue}: {source}")]
    Consume {
        /// Queue name
        queue: String,
        /// Broker error
        #[source]
        source: BrokerError,
    },
}

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Envelope published to the engine
    Published,
    /// Engine rejected the publish
    PublishFailed,
    /// Body was not a valid envelope
    Malformed,
}

/// Counters of a bridge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Deliveries received
    pub received: u64,
    /// Envelopes published
    pub published: u64,
    /// Publishes the engine rejected
    pub publish_failed: u64,
    /// Bodies that failed to decode
    pub malformed: u64,
    /// Acks the broker refused
    pub ack_failed: u64,
}

impl BridgeStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        self.received += 1;
        match outcome {
            DeliveryOutcome::Published => self.published += 1,
            DeliveryOutcome::PublishFailed => self.publish_failed += 1,
            DeliveryOutcome::Malformed => self.malformed += 1,
        }
    }
}

/// Consumes broker envelopes and republishes them as engine messages.
pub struct MessageBridge {
    broker: Arc<dyn Broker>,
    client: Arc<dyn EngineClient>,
    queue: QueueSpec,
    prefetch: u16,
}

impl MessageBridge {
    /// Bridge the default queue with the default prefetch.
    pub fn new(broker: Arc<dyn Broker>, client: Arc<dyn EngineClient>) -> Self {
        Self {
            broker,
            client,
            queue: QueueSpec::default(),
            prefetch: DEFAULT_PREFETCH,
        }
    }

    /// Consume `queue` instead of the default one.
    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queue = queue;
        self
    }

    /// Set the prefetch count.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Queue being consumed.
    pub fn queue(&self) -> &QueueSpec {
        &self.queue
    }

    /// Consume until `shutdown` changes or the broker closes the stream.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<BridgeStats, BridgeError> {
        self.broker
            .declare_queue(&self.queue)
            .await
            .map_err(|source| BridgeError::Declare {
                queue: self.queue.name.clone(),
                source,
            })?;
        let mut deliveries = self
            .broker
            .consume(&self.queue.name, self.prefetch)
            .await
            .map_err(|source| BridgeError::Consume {
                queue: self.queue.name.clone(),
                source,
            })?;
        info!(queue = %self.queue.name, prefetch = self.prefetch, "Waiting for messages");

        let mut stats = BridgeStats::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => {
                        let tag = delivery.tag;
                        stats.record(self.forward(delivery).await);
                        if let Err(e) = self.broker.ack(tag).await {
                            error!(queue = %self.queue.name, "Failed to ack delivery {}: {}", tag, e);
                            stats.ack_failed += 1;
                        }
                    }
                    None => {
                        warn!(queue = %self.queue.name, "Broker closed the delivery stream");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!(
            queue = %self.queue.name,
            received = stats.received,
            published = stats.published,
            "Bridge stopped"
        );
        Ok(stats)
    }

    /// Decode one delivery and publish it. Never acks.
    pub async fn forward(&self, delivery: Delivery) -> DeliveryOutcome {
        let envelope = match BrokerEnvelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.queue.name, "Dropping malformed delivery {}: {}", delivery.tag, e);
                return DeliveryOutcome::Malformed;
            }
        };

        let spec = envelope.spec();
        debug!(message = %spec.name, correlation_key = %spec.correlation_key, "Received message");
        match self.client.publish_message(&spec, envelope.payload).await {
            Ok(()) => {
                info!(
                    message = %spec.name,
                    correlation_key = %spec.correlation_key,
                    "Published message"
                );
                DeliveryOutcome::Published
            }
            Err(e) => {
                error!(
                    message = %spec.name,
                    correlation_key = %spec.correlation_key,
                    "Failed to publish message: {}",
                    e
                );
                DeliveryOutcome::PublishFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use jobsync_core::{variables_from, MessageSpec, Variables};
    use jobsync_engine::{EngineOp, InMemoryEngine};
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Running {
        broker: Arc<InMemoryBroker>,
        engine: Arc<InMemoryEngine>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<Result<BridgeStats, BridgeError>>,
    }

    async fn start(engine: Arc<InMemoryEngine>) -> Running {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue(&QueueSpec::default()).await.unwrap();
        let bridge = MessageBridge::new(broker.clone(), engine.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { bridge.run(shutdown_rx).await });
        Running {
            broker,
            engine,
            shutdown,
            handle,
        }
    }

    async fn wait_acked(broker: &InMemoryBroker, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.acked().await.len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn stop(running: Running) -> BridgeStats {
        running.shutdown.send(true).unwrap();
        running.handle.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_envelope_is_published_and_acked() {
        let running = start(Arc::new(InMemoryEngine::new())).await;

        running
            .broker
            .publish(
                "acme_messages",
                r#"{"name":"N","correlation_key":"0","payload":{"k":"v"}}"#,
            )
            .await
            .unwrap();
        wait_acked(&running.broker, 1).await;

        assert_eq!(
            running.engine.published().await,
            vec![(MessageSpec::new("N", "0"), variables_from(json!({"k": "v"})))]
        );
        let stats = stop(running).await;
        assert_eq!(stats.received, 1);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test]
    async fn test_malformed_delivery_is_acked_without_publish() {
        let running = start(Arc::new(InMemoryEngine::new())).await;

        running
            .broker
            .publish("acme_messages", "not json")
            .await
            .unwrap();
        running
            .broker
            .publish("acme_messages", r#"{"correlation_key":"0"}"#)
            .await
            .unwrap();
        wait_acked(&running.broker, 2).await;

        assert!(running.engine.published().await.is_empty());
        assert_eq!(running.broker.outstanding().await, 0);
        let stats = stop(running).await;
        assert_eq!(stats.malformed, 2);
    }

    #[tokio::test]
    async fn test_null_payload_and_missing_key_are_published() {
        let running = start(Arc::new(InMemoryEngine::new())).await;

        running
            .broker
            .publish("acme_messages", r#"{"name":"N","correlation_key":"0","payload":null}"#)
            .await
            .unwrap();
        running
            .broker
            .publish("acme_messages", r#"{"name":"K","payload":{"k":"v"}}"#)
            .await
            .unwrap();
        wait_acked(&running.broker, 2).await;

        assert_eq!(
            running.engine.published().await,
            vec![
                (MessageSpec::new("N", "0"), Variables::new()),
                (MessageSpec::new("K", ""), variables_from(json!({"k": "v"}))),
            ]
        );
        let stats = stop(running).await;
        assert_eq!(stats.published, 2);
        assert_eq!(stats.malformed, 0);
    }

    #[tokio::test]
    async fn test_rejected_publish_is_still_acked() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.set_failing(EngineOp::Publish, true).await;
        let running = start(engine).await;

        running
            .broker
            .publish("acme_messages", r#"{"name":"N","correlation_key":"1"}"#)
            .await
            .unwrap();
        wait_acked(&running.broker, 1).await;

        let stats = stop(running).await;
        assert_eq!(stats.publish_failed, 1);
        assert_eq!(stats.ack_failed, 0);
    }

    #[tokio::test]
    async fn test_deliveries_are_handled_in_order() {
        let running = start(Arc::new(InMemoryEngine::new())).await;

        for i in 0..3 {
            let body = json!({"name": format!("N{}", i), "correlation_key": "0"}).to_string();
            running.broker.publish("acme_messages", body).await.unwrap();
        }
        wait_acked(&running.broker, 3).await;

        let names: Vec<_> = running
            .engine
            .published()
            .await
            .into_iter()
            .map(|(spec, _)| spec.name)
            .collect();
        assert_eq!(names, vec!["N0", "N1", "N2"]);
        stop(running).await;
    }

    #[tokio::test]
    async fn test_queue_flag_mismatch_fails_the_bridge() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .declare_queue(&QueueSpec::default().durable(true))
            .await
            .unwrap();
        let bridge = MessageBridge::new(broker, Arc::new(InMemoryEngine::new()));
        let (_tx, rx) = watch::channel(false);

        assert!(matches!(
            bridge.run(rx).await,
            Err(BridgeError::Declare { .. })
        ));
    }
}
