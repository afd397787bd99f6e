use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectPolicy;
use super::broker::{Broker, BrokerLink, DeliveryStream, OutboundMessage, QueueSpec};
use super::channel::ChannelError;
use super::connection::ConnectionError;
use super::delivery::Delivery;
use super::state::TransportState;

const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub input_queue: String,
    /// Results are published here; `None` disables publishing.
    pub output_queue: Option<String>,
    /// Declare `<input>.dlq` and route rejected messages to it.
    pub dead_letter: bool,
    pub prefetch: u16,
    pub consumer_tag: String,
    pub reconnect: ReconnectPolicy,
}

impl TransportSettings {
    pub fn dead_letter_queue(&self) -> Option<String> {
        self.dead_letter
            .then(|| format!("{}.dlq", self.input_queue))
    }
}

struct Shared {
    state: watch::Sender<TransportState>,
    link: RwLock<Option<Arc<dyn BrokerLink>>>,
}

/// Owns the broker connection: connects with backoff, restores the
/// subscription after the link drops and hands out deliveries one by one.
pub struct Transport {
    broker: Arc<dyn Broker>,
    settings: TransportSettings,
    shared: Arc<Shared>,
    // Only touched through `&mut self`; the mutex keeps `Transport: Sync`.
    deliveries: Mutex<Option<DeliveryStream>>,
}

impl Transport {
    pub fn new(broker: Arc<dyn Broker>, settings: TransportSettings) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            broker,
            settings,
            shared: Arc::new(Shared {
                state,
                link: RwLock::new(None),
            }),
            deliveries: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    pub fn publisher(&self) -> TransportPublisher {
        TransportPublisher {
            shared: self.shared.clone(),
        }
    }

    /// Initial connection. The first attempt is immediate; later attempts
    /// follow the reconnect policy.
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.set_state(TransportState::Connecting);
        info!(endpoint = %self.broker.describe(), "Connecting transport");
        match self.establish(cancel, false).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_state(TransportState::Disconnected);
                Err(e)
            }
        }
    }

    pub async fn start_consuming(&mut self) -> Result<(), TransportError> {
        let link = self.current_link().await.ok_or(TransportError::NotConnected)?;
        let stream = self.subscribe(link.as_ref()).await?;
        *self.deliveries() = Some(stream);
        self.set_state(TransportState::Consuming);
        Ok(())
    }

    /// Next delivery from the input queue. Link failures are handled here by
    /// reconnecting and restoring the subscription; they only surface as an
    /// error once the reconnect attempts run out. Returns `Ok(None)` once
    /// `cancel` fires.
    pub async fn next_delivery(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>, TransportError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            if self.deliveries().is_none() {
                match self.reconnect(cancel).await {
                    Ok(()) => continue,
                    Err(TransportError::Cancelled) => return Ok(None),
                    Err(e) => return Err(e),
                }
            }

            let Some(stream) = self.deliveries().as_mut() else {
                continue;
            };

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => return Ok(Some(delivery)),
                Some(Err(e)) => warn!(error = %e, "Delivery stream failed"),
                None => warn!("Delivery stream ended"),
            }

            *self.deliveries() = None;
        }
    }

    /// Cancels the subscription so no further deliveries arrive. The link
    /// stays open for in-flight acknowledgments and publishes.
    pub async fn stop_consuming(&mut self) {
        if self.deliveries().take().is_none() {
            return;
        }

        if let Some(link) = self.current_link().await {
            if let Err(e) = link.cancel_consumer(&self.settings.consumer_tag).await {
                warn!(error = %e, "Failed to cancel consumer");
            }
        }

        if self.state() == TransportState::Consuming {
            self.set_state(TransportState::Connected);
        }
        info!(consumer_tag = %self.settings.consumer_tag, "Stopped consuming");
    }

    /// Closes the channel, then the connection.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        *self.deliveries() = None;
        let link = self.shared.link.write().await.take();
        self.set_state(TransportState::Disconnected);

        if let Some(link) = link {
            match tokio::time::timeout(LINK_CLOSE_TIMEOUT, link.close()).await {
                Ok(closed) => closed?,
                Err(_) => warn!("Timed out closing broker link"),
            }
        }

        info!("Transport shut down");
        Ok(())
    }

    pub async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        self.publisher().publish(queue, message).await
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.set_state(TransportState::Reconnecting);

        if let Some(stale) = self.shared.link.write().await.take() {
            match tokio::time::timeout(LINK_CLOSE_TIMEOUT, stale.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Stale link did not close cleanly"),
                Err(_) => debug!("Timed out closing stale link"),
            }
        }

        warn!(endpoint = %self.broker.describe(), "Connection lost, reconnecting");

        let stream = self.establish(cancel, true).await?;
        *self.deliveries() = stream;
        self.set_state(TransportState::Consuming);
        info!("Subscription restored");
        Ok(())
    }

    /// Runs one connection episode. Each attempt connects, declares the
    /// topology and, when `resubscribe` is set, restarts the consumer.
    async fn establish(
        &mut self,
        cancel: &CancellationToken,
        resubscribe: bool,
    ) -> Result<Option<DeliveryStream>, TransportError> {
        let policy = self.settings.reconnect.clone();
        let max_attempts = policy.attempts();
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            let wait = match (resubscribe, attempt) {
                (false, 0) => None,
                (false, n) => Some(policy.delay_for_attempt(n - 1)),
                (true, n) => Some(policy.delay_for_attempt(n)),
            };

            if let Some(delay) = wait {
                info!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before connection attempt"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.open_link(resubscribe).await {
                Ok((link, stream)) => {
                    *self.shared.link.write().await = Some(link);
                    self.set_state(TransportState::Connected);
                    info!(attempt = attempt + 1, "Transport connected");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        error!(attempts = max_attempts, error = %last_error, "Connection attempts exhausted");
        Err(TransportError::ConnectionExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn open_link(
        &self,
        resubscribe: bool,
    ) -> Result<(Arc<dyn BrokerLink>, Option<DeliveryStream>), TransportError> {
        let link = self.broker.connect().await?;

        match self.prepare_link(link.as_ref(), resubscribe).await {
            Ok(stream) => Ok((link, stream)),
            Err(e) => {
                if let Err(close_error) = link.close().await {
                    debug!(error = %close_error, "Half-prepared link did not close cleanly");
                }
                Err(e)
            }
        }
    }

    async fn prepare_link(
        &self,
        link: &dyn BrokerLink,
        resubscribe: bool,
    ) -> Result<Option<DeliveryStream>, TransportError> {
        self.declare_topology(link).await?;
        if resubscribe {
            self.subscribe(link).await.map(Some)
        } else {
            Ok(None)
        }
    }

    async fn declare_topology(&self, link: &dyn BrokerLink) -> Result<(), TransportError> {
        let mut input = QueueSpec::durable(&self.settings.input_queue);
        if let Some(dlq) = self.settings.dead_letter_queue() {
            input = input.with_dead_letter(dlq);
        }
        link.declare_queue(&input).await?;

        if let Some(output) = &self.settings.output_queue {
            link.declare_queue(&QueueSpec::durable(output)).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, link: &dyn BrokerLink) -> Result<DeliveryStream, TransportError> {
        let stream = link
            .consume(
                &self.settings.input_queue,
                &self.settings.consumer_tag,
                self.settings.prefetch,
            )
            .await?;

        info!(
            queue = %self.settings.input_queue,
            consumer_tag = %self.settings.consumer_tag,
            prefetch = self.settings.prefetch,
            "Consuming from input queue"
        );
        Ok(stream)
    }

    fn deliveries(&mut self) -> &mut Option<DeliveryStream> {
        self.deliveries
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.shared.link.read().await.clone()
    }

    fn set_state(&self, next: TransportState) {
        let previous = self.shared.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Transport state changed");
        }
    }
}

/// Cloneable publishing handle. Fails fast with
/// [`TransportError::NotConnected`] while the transport has no usable link.
#[derive(Clone)]
pub struct TransportPublisher {
    shared: Arc<Shared>,
}

impl TransportPublisher {
    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    pub async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.state().can_publish() {
            return Err(TransportError::NotConnected);
        }

        let link = self
            .shared
            .link
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;

        // The state lags a dead socket until the consumer notices it.
        if !link.is_connected() {
            return Err(TransportError::NotConnected);
        }

        link.publish(queue, message).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to start consumer on {queue}: {reason}")]
    ConsumeFailed { queue: String, reason: String },

    #[error("Connection to broker lost: {0}")]
    ConnectionLost(String),

    #[error("Gave up connecting after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Failed to publish to {queue}: {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("Failed to settle delivery {delivery_tag}: {reason}")]
    AckFailed { delivery_tag: u64, reason: String },

    #[error("Transport operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::delivery::AckDecision;
    use crate::messaging::memory::InMemoryBroker;

    fn settings() -> TransportSettings {
        TransportSettings {
            input_queue: "in".to_string(),
            output_queue: Some("out".to_string()),
            dead_letter: false,
            prefetch: 1,
            consumer_tag: "transport-test".to_string(),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_attempts: 3,
                jitter: false,
            },
        }
    }

    fn transport(broker: &InMemoryBroker) -> Transport {
        Transport::new(Arc::new(broker.clone()), settings())
    }

    async fn next(transport: &mut Transport) -> Delivery {
        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), transport.next_delivery(&cancel))
            .await
            .expect("delivery timed out")
            .unwrap()
            .expect("stream closed")
    }

    #[tokio::test]
    async fn test_connect_declares_topology() {
        let broker = InMemoryBroker::new();
        let mut transport = transport(&broker);

        transport.connect(&CancellationToken::new()).await.unwrap();

        assert_eq!(transport.state(), TransportState::Connected);
        assert!(broker.has_queue("in"));
        assert!(broker.has_queue("out"));
        assert!(!broker.has_queue("in.dlq"));
    }

    #[tokio::test]
    async fn test_connect_retries_with_backoff() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let mut transport = transport(&broker);

        transport.connect(&CancellationToken::new()).await.unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(transport.state(), TransportState::Connected);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(10);
        let mut transport = transport(&broker);

        let err = transport
            .connect(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::ConnectionExhausted { attempts: 3, .. }));
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_cancelled_during_backoff() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(10);
        let mut transport = transport(&broker);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport.connect(&cancel).await.unwrap_err();

        assert!(matches!(err, TransportError::Cancelled));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = InMemoryBroker::new();
        let mut transport = transport(&broker);
        let message = OutboundMessage {
            payload: b"{}".to_vec(),
            message_id: None,
        };

        let err = transport.publish("out", &message).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));

        transport.connect(&CancellationToken::new()).await.unwrap();
        transport.publish("out", &message).await.unwrap();
        assert_eq!(broker.published("out").len(), 1);

        transport.shutdown().await.unwrap();
        let err = transport.publisher().publish("out", &message).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_publish_fails_fast_while_reconnecting() {
        let broker = InMemoryBroker::new();
        let mut settings = settings();
        settings.reconnect.initial_delay = Duration::from_millis(200);
        settings.reconnect.max_delay = Duration::from_millis(200);
        let mut transport = Transport::new(Arc::new(broker.clone()), settings);
        transport.connect(&CancellationToken::new()).await.unwrap();
        transport.start_consuming().await.unwrap();

        let publisher = transport.publisher();
        let mut states = transport.watch_state();
        let message = OutboundMessage {
            payload: b"{}".to_vec(),
            message_id: None,
        };

        broker.fail_next_connects(10);
        broker.sever_links();

        // The consumer has not noticed yet, but the link itself is dead.
        assert_eq!(publisher.state(), TransportState::Consuming);
        let err = publisher.publish("out", &message).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));

        let cancel = CancellationToken::new();
        let consumer_cancel = cancel.clone();
        let consumer = tokio::spawn(async move {
            transport
                .next_delivery(&consumer_cancel)
                .await
                .map(|delivery| delivery.is_none())
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == TransportState::Reconnecting),
        )
        .await
        .expect("reconnecting state not reached")
        .unwrap();

        let err = publisher.publish("out", &message).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(broker.published("out").is_empty());

        cancel.cancel();
        assert!(consumer.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_consumes_in_queue_order() {
        let broker = InMemoryBroker::new();
        broker.enqueue("in", b"first".to_vec());
        broker.enqueue("in", b"second".to_vec());
        let mut transport = transport(&broker);
        transport.connect(&CancellationToken::new()).await.unwrap();
        transport.start_consuming().await.unwrap();
        assert_eq!(transport.state(), TransportState::Consuming);

        let first = next(&mut transport).await;
        assert_eq!(first.payload, b"first");
        first.handle.settle(AckDecision::Accept).await.unwrap();

        let second = next(&mut transport).await;
        assert_eq!(second.payload, b"second");
        second.handle.settle(AckDecision::Accept).await.unwrap();
    }

    #[tokio::test]
    async fn test_restores_subscription_after_link_loss() {
        let broker = InMemoryBroker::new();
        broker.enqueue("in", b"payload".to_vec());
        let mut transport = transport(&broker);
        transport.connect(&CancellationToken::new()).await.unwrap();
        transport.start_consuming().await.unwrap();

        let stale = next(&mut transport).await;
        broker.fail_next_connects(1);
        broker.sever_links();

        let redelivered = next(&mut transport).await;
        assert_eq!(redelivered.payload, b"payload");
        assert!(redelivered.metadata.redelivered);
        assert_eq!(transport.state(), TransportState::Consuming);
        assert_eq!(broker.connect_attempts(), 3);

        // The old channel is gone, so its delivery can no longer be settled.
        let err = stale.handle.settle(AckDecision::Accept).await.unwrap_err();
        assert!(matches!(err, TransportError::AckFailed { .. }));
        redelivered.handle.settle(AckDecision::Accept).await.unwrap();

        assert_eq!(broker.settlements().len(), 1);
    }

    #[tokio::test]
    async fn test_next_delivery_returns_none_when_cancelled() {
        let broker = InMemoryBroker::new();
        let mut transport = transport(&broker);
        transport.connect(&CancellationToken::new()).await.unwrap();
        transport.start_consuming().await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waiter.cancel();
        });

        assert!(transport.next_delivery(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_queue_declared_when_enabled() {
        let broker = InMemoryBroker::new();
        let mut settings = settings();
        settings.dead_letter = true;
        let mut transport = Transport::new(Arc::new(broker.clone()), settings);

        transport.connect(&CancellationToken::new()).await.unwrap();

        assert!(broker.has_queue("in.dlq"));
    }
}
