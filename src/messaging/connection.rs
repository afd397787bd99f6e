use lapin::{Connection, ConnectionProperties};
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info};

/// An open AMQP connection. The URI carries credentials, so only the
/// redacted `endpoint` ever reaches the logs.
pub struct RabbitMqConnection {
    connection: Connection,
    endpoint: String,
}

impl RabbitMqConnection {
    pub async fn connect(uri: &SecretString, endpoint: &str) -> Result<Self, ConnectionError> {
        info!(endpoint, "Connecting to RabbitMQ");

        let connection = Connection::connect(uri.expose_secret(), ConnectionProperties::default())
            .await
            .map_err(|e| {
                error!(error = %e, endpoint, "Failed to connect to RabbitMQ");
                ConnectionError::ConnectionFailed(e.to_string())
            })?;

        info!(endpoint, "Connected to RabbitMQ");

        Ok(Self {
            connection,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn get_connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            info!(endpoint = %self.endpoint, "RabbitMQ connection already closed");
            return Ok(());
        }

        info!(endpoint = %self.endpoint, "Closing RabbitMQ connection");

        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to close RabbitMQ connection gracefully");
                ConnectionError::ShutdownFailed(e.to_string())
            })?;

        info!(endpoint = %self.endpoint, "RabbitMQ connection closed");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),

    #[error("Failed to shutdown connection gracefully: {0}")]
    ShutdownFailed(String),
}
