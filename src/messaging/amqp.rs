use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel,
    acker::Acker,
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions},
    types::{AMQPValue, FieldTable},
};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::broker::{Broker, BrokerLink, DeliveryStream, OutboundMessage, QueueSpec};
use super::channel::ChannelProvider;
use super::connection::RabbitMqConnection;
use super::delivery::{Acknowledger, Delivery, DeliveryHandle, DeliveryMetadata};
use super::transport::TransportError;

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// RabbitMQ over AMQP 0-9-1.
pub struct AmqpBroker {
    uri: SecretString,
    endpoint: String,
}

impl AmqpBroker {
    pub fn new(uri: SecretString, endpoint: impl Into<String>) -> Self {
        Self {
            uri,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerLink>, TransportError> {
        let connection = RabbitMqConnection::connect(&self.uri, &self.endpoint).await?;

        let channel = match ChannelProvider::create_channel(connection.get_connection()).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_error) = connection.shutdown().await {
                    debug!(error = %close_error, "Connection without a channel did not close cleanly");
                }
                return Err(e.into());
            }
        };

        Ok(Arc::new(AmqpLink {
            connection,
            channel,
        }))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

struct AmqpLink {
    connection: RabbitMqConnection,
    channel: Channel,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        ChannelProvider::declare_queue(&self.channel, spec).await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, TransportError> {
        ChannelProvider::configure_qos(&self.channel, prefetch).await?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue, "Failed to start consumer");
                TransportError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                }
            })?;

        info!(queue, consumer_tag, prefetch, "Consumer started");

        let stream = consumer.map(|item| match item {
            Ok(delivery) => Ok(into_delivery(delivery)),
            Err(e) => Err(TransportError::ConnectionLost(e.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;

        info!(consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        let publish_failed = |reason: String| TransportError::PublishFailed {
            queue: queue.to_string(),
            reason,
        };

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into());
        if let Some(id) = &message.message_id {
            properties = properties.with_message_id(id.clone().into());
        }

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| publish_failed(e.to_string()))?
            .await
            .map_err(|e| publish_failed(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(publish_failed("broker negatively acknowledged the message".to_string()));
        }

        debug!(
            queue,
            message_id = message.message_id.as_deref().unwrap_or(""),
            payload_size = message.payload.len(),
            "Message published"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channel_result = ChannelProvider::close_channel(&self.channel).await;
        self.connection.shutdown().await?;
        channel_result?;
        Ok(())
    }
}

struct AmqpAcker {
    acker: Acker,
    delivery_tag: u64,
}

impl AmqpAcker {
    fn failed(&self, e: lapin::Error) -> TransportError {
        TransportError::AckFailed {
            delivery_tag: self.delivery_tag,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| self.failed(e))
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|e| self.failed(e))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let delivery_tag = delivery.delivery_tag;

    let metadata = DeliveryMetadata {
        delivery_tag,
        routing_key: delivery.routing_key.as_str().to_string(),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        redelivered: delivery.redelivered,
        delivery_count: delivery_count(&delivery.properties),
    };

    let handle = DeliveryHandle::new(
        delivery_tag,
        Box::new(AmqpAcker {
            acker: delivery.acker,
            delivery_tag,
        }),
    );

    Delivery {
        payload: delivery.data,
        metadata,
        handle,
    }
}

fn delivery_count(properties: &BasicProperties) -> Option<u32> {
    let headers = properties.headers().as_ref()?;
    match headers.inner().get(DELIVERY_COUNT_HEADER)? {
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}
