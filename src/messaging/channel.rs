use lapin::{
    Channel, Connection,
    options::{BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
};
use tracing::{error, info};

use super::broker::QueueSpec;

pub struct ChannelProvider;

impl ChannelProvider {
    /// Opens a channel with publisher confirms enabled.
    pub async fn create_channel(connection: &Connection) -> Result<Channel, ChannelError> {
        info!("Creating RabbitMQ channel");

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            ChannelError::CreationFailed(e.to_string())
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, channel_id = channel.id(), "Failed to enable publisher confirms");
                ChannelError::CreationFailed(e.to_string())
            })?;

        info!(channel_id = channel.id(), "Channel created");
        Ok(channel)
    }

    pub async fn configure_qos(channel: &Channel, prefetch: u16) -> Result<(), ChannelError> {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, prefetch, "Failed to configure channel QoS");
                ChannelError::QoSConfigurationFailed(e.to_string())
            })?;

        info!(channel_id = channel.id(), prefetch, "Channel QoS configured");
        Ok(())
    }

    /// Declares a durable queue. With a dead-letter queue configured, that
    /// queue is declared first and rejected messages are routed to it through
    /// the default exchange.
    pub async fn declare_queue(channel: &Channel, spec: &QueueSpec) -> Result<(), ChannelError> {
        let mut args = FieldTable::default();

        if let Some(dlq) = &spec.dead_letter_queue {
            Self::declare_durable(channel, dlq, FieldTable::default()).await?;

            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString("".into()),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dlq.clone().into()),
            );
        }

        Self::declare_durable(channel, &spec.name, args).await?;

        info!(
            queue = %spec.name,
            dlq = spec.dead_letter_queue.as_deref().unwrap_or("none"),
            "Queue declared"
        );
        Ok(())
    }

    async fn declare_durable(
        channel: &Channel,
        name: &str,
        args: FieldTable,
    ) -> Result<(), ChannelError> {
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = name, "Failed to declare queue");
                ChannelError::QueueDeclarationFailed {
                    queue: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
        Ok(())
    }

    pub async fn close_channel(channel: &Channel) -> Result<(), ChannelError> {
        let channel_id = channel.id();

        if !channel.status().connected() {
            info!(channel_id, "Channel already closed");
            return Ok(());
        }

        info!(channel_id, "Closing RabbitMQ channel");

        channel.close(200, "Normal shutdown").await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            ChannelError::CloseFailed(e.to_string())
        })?;

        info!(channel_id, "Channel closed");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to create channel: {0}")]
    CreationFailed(String),

    #[error("Failed to configure channel QoS: {0}")]
    QoSConfigurationFailed(String),

    #[error("Failed to declare queue {queue}: {reason}")]
    QueueDeclarationFailed { queue: String, reason: String },

    #[error("Failed to close channel: {0}")]
    CloseFailed(String),
}
