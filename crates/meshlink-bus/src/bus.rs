//! Message broker abstraction.
//!
//! [`MessageBus`] is the small slice of AMQP 0-9-1 that meshlink uses: topic
//! exchanges, exclusive broker-named queues, routing-key bindings,
//! no-ack consumption, and publishing with `reply_to`/`correlation_id`
//! properties. [`AmqpBus`](crate::AmqpBus) talks to a real broker;
//! [`MemoryBus`](crate::MemoryBus) is an in-process broker with the same
//! routing rules.

use async_trait::async_trait;
use tokio::sync::mpsc;

use meshlink_core::error::Result;

/// The default (nameless) exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Message properties used for request/reply correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Queue the reply should be published to.
    pub reply_to: Option<String>,
    /// Token echoed in the reply.
    pub correlation_id: Option<String>,
}

impl MessageProperties {
    /// Properties for an RPC request.
    pub fn request(reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Properties for an RPC reply.
    pub fn reply(correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: None,
            correlation_id: Some(correlation_id.into()),
        }
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Correlation properties.
    pub properties: MessageProperties,
    /// Message body.
    pub body: Vec<u8>,
}

/// Stream of deliveries from one queue.
///
/// Closes when the consumer is cancelled or the connection ends.
pub type Deliveries = mpsc::UnboundedReceiver<Delivery>;

/// A connection to a message broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Declare a topic exchange. Declaring an existing exchange is not an
    /// error.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue and return its name.
    ///
    /// An empty `name` asks the broker to generate one. Exclusive queues are
    /// deleted when this connection closes.
    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String>;

    /// Bind `queue` to `exchange` with a topic pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Start consuming `queue` without acknowledgements.
    async fn consume(&self, queue: &str) -> Result<Deliveries>;

    /// Publish one message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<()>;

    /// Close the connection. Consumers on it stop receiving.
    async fn close(&self) -> Result<()>;
}
