//! Message broker client.
//!
//! Queues are durable (quorum on RabbitMQ), messages are persistent, and
//! consumption is pull-based with manual acknowledgement: a delivery that is
//! not acked before its channel goes away is redelivered.

mod memory;
mod publisher;
mod rabbit;
mod reader;

pub use self::memory::MemoryBroker;
pub use self::publisher::WorkPublisher;
pub use self::rabbit::RabbitBroker;
pub use self::reader::{QueueReader, ReaderError};

use async_trait::async_trait;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker channel closed: {0}")]
    ChannelClosed(String),

    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    #[error("delivery {0} belongs to a closed channel")]
    StaleDelivery(u64),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("queue {queue} already declared with different arguments")]
    PreconditionFailed { queue: String },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl QueueError {
    /// Errors after which the session must be reopened before retrying
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::ChannelClosed(_))
    }
}

/// Queue declaration. Declaring the same spec twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub quorum: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn quorum(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quorum: true,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange;
        self
    }
}

/// A message handed out by [`MessageBroker::get`] and not yet settled
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
    /// Session the delivery was received on; tags are only valid within it
    pub epoch: u64,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), QueueError>;

    /// Publish a persistent message, returning once the broker has confirmed it
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Fetch at most one message without auto-ack
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Messages ready for delivery
    async fn message_count(&self, queue: &str) -> Result<u32, QueueError>;

    /// True when both the connection and the channel are open
    async fn health_check(&self) -> bool;

    /// Replace a dead session with a fresh connection and channel.
    ///
    /// An open session is kept, so callers that raced on the same failure
    /// reopen once and keep each other's deliveries valid.
    async fn reconnect(&self) -> Result<(), QueueError>;

    async fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.health_check().await {
            return Ok(());
        }
        warn!("Broker session is closed, reconnecting");
        self.reconnect().await
    }
}
