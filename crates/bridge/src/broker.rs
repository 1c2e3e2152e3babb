//! Message broker boundary.

use async_trait::async_trait;
use jobsync_core::DeliveryTag;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::debug;

/// Queue consumed by the bridge unless configured otherwise.
pub const DEFAULT_QUEUE: &str = "acme_messages";

/// Unacknowledged deliveries allowed per consumer unless configured otherwise.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Broker errors
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Broker cannot be reached
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// Queue was never declared
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Queue redeclared with different flags
    #[error("Queue {0} already declared with different flags")]
    QueueMismatch(String),

    /// Queue already has a consumer
    #[error("Queue {0} already has a consumer")]
    AlreadyConsumed(String),

    /// Ack for a delivery that is not outstanding
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(DeliveryTag),
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survives a broker restart
    pub durable: bool,
    /// Deleted once its last consumer goes away
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A transient, auto-deleted queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: true,
        }
    }

    /// Set durability.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Set auto-delete.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag to acknowledge with
    pub tag: DeliveryTag,
    /// Raw body
    pub body: Vec<u8>,
}

/// Message broker the bridge consumes from.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare `spec`, creating the queue if needed. Redeclaring with the
    /// same flags is a no-op.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged
    /// deliveries outstanding.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<mpsc::Receiver<Delivery>>;

    /// Acknowledge one delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;
}

struct QueueState {
    spec: QueueSpec,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    outstanding: HashMap<DeliveryTag, Arc<Semaphore>>,
    acked: Vec<DeliveryTag>,
}

/// Broker kept entirely in memory, with per-consumer prefetch.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    next_tag: Arc<AtomicU64>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body on a declared queue.
    pub async fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        let state = self.state.lock().await;
        let queue_state = state
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        queue_state
            .tx
            .send(body.into())
            .map_err(|_| BrokerError::Connection(format!("queue {} is gone", queue)))
    }

    /// Tags acknowledged so far, in order.
    pub async fn acked(&self) -> Vec<DeliveryTag> {
        self.state.lock().await.acked.clone()
    }

    /// Deliveries handed out but not yet acknowledged.
    pub async fn outstanding(&self) -> usize {
        self.state.lock().await.outstanding.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.queues.get(&spec.name) {
            if &existing.spec != spec {
                return Err(BrokerError::QueueMismatch(spec.name.clone()));
            }
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.queues.insert(
            spec.name.clone(),
            QueueState {
                spec: spec.clone(),
                tx,
                rx: Some(rx),
            },
        );
        debug!(queue = %spec.name, durable = spec.durable, auto_delete = spec.auto_delete, "Declared queue");
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<mpsc::Receiver<Delivery>> {
        let mut source = {
            let mut state = self.state.lock().await;
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            queue_state
                .rx
                .take()
                .ok_or_else(|| BrokerError::AlreadyConsumed(queue.to_string()))?
        };

        let credits = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
        let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
        let state = Arc::clone(&self.state);
        let next_tag = Arc::clone(&self.next_tag);

        tokio::spawn(async move {
            while let Some(body) = source.recv().await {
                let Ok(permit) = Arc::clone(&credits).acquire_owned().await else {
                    break;
                };
                permit.forget();

                let tag = DeliveryTag(next_tag.fetch_add(1, Ordering::SeqCst) + 1);
                state
                    .lock()
                    .await
                    .outstanding
                    .insert(tag, Arc::clone(&credits));
                if tx.send(Delivery { tag, body }).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock().await;
        let credits = state
            .outstanding
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        credits.add_permits(1);
        state.acked.push(tag);
        Ok(())
    }
}
