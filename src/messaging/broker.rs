//! The seam between the transport state machine and a concrete broker.
//!
//! [`AmqpBroker`](super::amqp::AmqpBroker) talks to RabbitMQ;
//! [`InMemoryBroker`](super::memory::InMemoryBroker) keeps everything in
//! process.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::delivery::Delivery;
use super::transport::TransportError;

/// Deliveries from one subscription. An `Err` item or the end of the stream
/// means the link is gone.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Where rejected-without-requeue messages are routed.
    pub dead_letter_queue: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_queue: None,
        }
    }

    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a connection and a channel on it.
    async fn connect(&self) -> Result<Arc<dyn BrokerLink>, TransportError>;

    /// Endpoint description safe to log.
    fn describe(&self) -> String;
}

/// One open connection + channel pair.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, TransportError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Closes the channel, then the connection.
    async fn close(&self) -> Result<(), TransportError>;
}
