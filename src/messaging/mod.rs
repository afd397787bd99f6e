pub mod amqp;
pub mod backoff;
pub mod broker;
pub mod channel;
pub mod connection;
pub mod delivery;
pub mod memory;
pub mod state;
pub mod transport;

pub use amqp::AmqpBroker;
pub use backoff::ReconnectPolicy;
pub use broker::{Broker, BrokerLink, DeliveryStream, OutboundMessage, QueueSpec};
pub use channel::{ChannelError, ChannelProvider};
pub use connection::{ConnectionError, RabbitMqConnection};
pub use delivery::{AckDecision, Acknowledger, Delivery, DeliveryHandle, DeliveryMetadata};
pub use memory::{InMemoryBroker, Settlement};
pub use state::TransportState;
pub use transport::{Transport, TransportError, TransportPublisher, TransportSettings};
