//! In-process broker with RabbitMQ-like delivery semantics: per-link prefetch,
//! redelivery of unsettled messages when a link goes away and dead-letter
//! routing for discarded messages. Backs the transport and runner tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::broker::{Broker, BrokerLink, DeliveryStream, OutboundMessage, QueueSpec};
use super::connection::ConnectionError;
use super::delivery::{AckDecision, Acknowledger, Delivery, DeliveryHandle, DeliveryMetadata};
use super::transport::TransportError;

/// A delivery decision the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub decision: AckDecision,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    message_id: Option<String>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    dead_letter: Option<String>,
}

#[derive(Debug)]
struct ConsumerState {
    queue: String,
    prefetch: u16,
}

#[derive(Debug, Default)]
struct LinkState {
    open: bool,
    severed: bool,
    next_tag: u64,
    consumers: HashMap<String, ConsumerState>,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    links: HashMap<u64, LinkState>,
    next_link: u64,
    connect_attempts: u32,
    failing_connects: u32,
    failing_publishes: u32,
    published: Vec<(String, OutboundMessage)>,
    settlements: Vec<Settlement>,
}

impl BrokerState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    /// Puts every unsettled message of a link back at the head of its queue,
    /// keeping the original order.
    fn release_unacked(&mut self, link_id: u64) -> usize {
        let Some(link) = self.links.get_mut(&link_id) else {
            return 0;
        };
        let released = std::mem::take(&mut link.unacked);
        let count = released.len();
        for (_, (queue, message)) in released.into_iter().rev() {
            self.queue(&queue).ready.push_front(message);
        }
        count
    }
}

enum Poll {
    Ready(Delivery),
    Empty,
    Cancelled,
    Closed { severed: bool },
}

struct Inner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.push(queue, payload.into(), None);
    }

    pub fn enqueue_with_id(&self, queue: &str, payload: impl Into<Vec<u8>>, message_id: &str) {
        self.push(queue, payload.into(), Some(message_id.to_string()));
    }

    fn push(&self, queue: &str, payload: Vec<u8>, message_id: Option<String>) {
        self.inner.lock().queue(queue).ready.push_back(StoredMessage {
            payload,
            message_id,
            deliveries: 0,
        });
        self.inner.changed.notify_waiters();
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.lock().failing_connects = count;
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.lock().failing_publishes = count;
    }

    /// Drops every open link as if the socket died. Unsettled messages go
    /// back to their queues and will be redelivered.
    pub fn sever_links(&self) {
        let mut state = self.inner.lock();
        let open: Vec<u64> = state
            .links
            .iter()
            .filter(|(_, link)| link.open)
            .map(|(id, _)| *id)
            .collect();

        for id in open {
            if let Some(link) = state.links.get_mut(&id) {
                link.open = false;
                link.severed = true;
            }
            let released = state.release_unacked(id);
            info!(link = id, released, "Severed in-memory link");
        }
        drop(state);
        self.inner.changed.notify_waiters();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.lock().connect_attempts
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.lock().queues.contains_key(queue)
    }

    /// Payloads waiting in a queue, head first.
    pub fn ready(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages published to a queue through a link.
    pub fn published(&self, queue: &str) -> Vec<OutboundMessage> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.lock().settlements.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.inner
            .lock()
            .links
            .values()
            .map(|link| link.unacked.len())
            .sum()
    }

    pub fn open_links(&self) -> usize {
        self.inner.lock().links.values().filter(|l| l.open).count()
    }

    /// Links the broker still tracks, open or severed.
    pub fn tracked_links(&self) -> usize {
        self.inner.lock().links.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerLink>, TransportError> {
        let mut state = self.inner.lock();
        state.connect_attempts += 1;

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ConnectionError::ConnectionFailed("connection refused".to_string()).into());
        }

        state.next_link += 1;
        let id = state.next_link;
        state.links.insert(
            id,
            LinkState {
                open: true,
                ..Default::default()
            },
        );
        debug!(link = id, "In-memory link opened");

        Ok(Arc::new(InMemoryLink {
            id,
            inner: self.inner.clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct InMemoryLink {
    id: u64,
    inner: Arc<Inner>,
}

impl InMemoryLink {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), TransportError> {
        match state.links.get(&self.id) {
            Some(link) if link.open => Ok(()),
            _ => Err(TransportError::ConnectionLost("link closed".to_string())),
        }
    }
}

#[async_trait]
impl BrokerLink for InMemoryLink {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        self.ensure_open(&state)?;

        if let Some(dlq) = &spec.dead_letter_queue {
            state.queue(dlq);
        }
        state.queue(&spec.name).dead_letter = spec.dead_letter_queue.clone();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, TransportError> {
        {
            let mut state = self.inner.lock();
            self.ensure_open(&state)?;
            if let Some(link) = state.links.get_mut(&self.id) {
                link.consumers.insert(
                    consumer_tag.to_string(),
                    ConsumerState {
                        queue: queue.to_string(),
                        prefetch,
                    },
                );
            }
        }

        let cursor = Cursor {
            inner: self.inner.clone(),
            link: self.id,
            consumer_tag: consumer_tag.to_string(),
            finished: false,
        };

        Ok(futures::stream::unfold(cursor, Cursor::next).boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError> {
        {
            let mut state = self.inner.lock();
            self.ensure_open(&state)?;
            if let Some(link) = state.links.get_mut(&self.id) {
                link.consumers.remove(consumer_tag);
            }
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        {
            let mut state = self.inner.lock();
            self.ensure_open(&state)?;

            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(TransportError::PublishFailed {
                    queue: queue.to_string(),
                    reason: "publish refused".to_string(),
                });
            }

            state.queue(queue).ready.push_back(StoredMessage {
                payload: message.payload.clone(),
                message_id: message.message_id.clone(),
                deliveries: 0,
            });
            state.published.push((queue.to_string(), message.clone()));
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ensure_open(&self.inner.lock()).is_ok()
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.inner.lock();
            state.release_unacked(self.id);
            state.links.remove(&self.id);
        }
        self.inner.changed.notify_waiters();
        debug!(link = self.id, "In-memory link closed");
        Ok(())
    }
}

struct Cursor {
    inner: Arc<Inner>,
    link: u64,
    consumer_tag: String,
    finished: bool,
}

impl Cursor {
    async fn next(mut self) -> Option<(Result<Delivery, TransportError>, Self)> {
        if self.finished {
            return None;
        }

        let inner = self.inner.clone();
        loop {
            // Register interest before inspecting state so a notification
            // between the check and the await is not lost.
            let changed = inner.changed.notified();

            match self.poll() {
                Poll::Ready(delivery) => return Some((Ok(delivery), self)),
                Poll::Empty => {}
                Poll::Cancelled => return None,
                Poll::Closed { severed: false } => return None,
                Poll::Closed { severed: true } => {
                    self.finished = true;
                    let err = TransportError::ConnectionLost("link severed".to_string());
                    return Some((Err(err), self));
                }
            }

            changed.await;
        }
    }

    fn poll(&self) -> Poll {
        let mut guard = self.inner.lock();
        let BrokerState { queues, links, .. } = &mut *guard;

        let Some(link) = links.get_mut(&self.link) else {
            return Poll::Closed { severed: false };
        };
        if !link.open {
            return Poll::Closed {
                severed: link.severed,
            };
        }
        let Some(consumer) = link.consumers.get(&self.consumer_tag) else {
            return Poll::Cancelled;
        };

        let in_flight = link
            .unacked
            .values()
            .filter(|(queue, _)| *queue == consumer.queue)
            .count();
        if consumer.prefetch > 0 && in_flight >= usize::from(consumer.prefetch) {
            return Poll::Empty;
        }

        let queue_name = consumer.queue.clone();
        let Some(mut message) = queues
            .get_mut(&queue_name)
            .and_then(|queue| queue.ready.pop_front())
        else {
            return Poll::Empty;
        };

        message.deliveries += 1;
        link.next_tag += 1;
        let delivery_tag = link.next_tag;
        link.unacked
            .insert(delivery_tag, (queue_name.clone(), message.clone()));

        let metadata = DeliveryMetadata {
            delivery_tag,
            routing_key: queue_name,
            message_id: message.message_id.clone(),
            redelivered: message.deliveries > 1,
            delivery_count: Some(message.deliveries - 1),
        };

        let acker = MemoryAcker {
            inner: self.inner.clone(),
            link: self.link,
            delivery_tag,
        };

        Poll::Ready(Delivery {
            payload: message.payload,
            metadata,
            handle: DeliveryHandle::new(delivery_tag, Box::new(acker)),
        })
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    link: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, decision: AckDecision) -> Result<(), TransportError> {
        let failed = |reason: &str| TransportError::AckFailed {
            delivery_tag: self.delivery_tag,
            reason: reason.to_string(),
        };

        {
            let mut state = self.inner.lock();
            let link = state.links.get_mut(&self.link).ok_or_else(|| failed("unknown channel"))?;
            if !link.open {
                return Err(failed("channel closed"));
            }
            let (queue, message) = link
                .unacked
                .remove(&self.delivery_tag)
                .ok_or_else(|| failed("unknown delivery tag"))?;

            match decision {
                AckDecision::Accept => {}
                AckDecision::RejectRequeue => {
                    state.queue(&queue).ready.push_front(message.clone());
                }
                AckDecision::RejectDiscard => {
                    if let Some(dlq) = state.queue(&queue).dead_letter.clone() {
                        state.queue(&dlq).ready.push_back(StoredMessage {
                            deliveries: 0,
                            ..message.clone()
                        });
                    }
                }
            }

            state.settlements.push(Settlement {
                queue,
                delivery_tag: self.delivery_tag,
                payload: message.payload,
                decision,
            });
        }

        self.inner.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(AckDecision::Accept)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(if requeue {
            AckDecision::RejectRequeue
        } else {
            AckDecision::RejectDiscard
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open(broker: &InMemoryBroker, dlq: Option<&str>) -> Arc<dyn BrokerLink> {
        let link = broker.connect().await.unwrap();
        let mut spec = QueueSpec::durable("jobs");
        if let Some(dlq) = dlq {
            spec = spec.with_dead_letter(dlq);
        }
        link.declare_queue(&spec).await.unwrap();
        link
    }

    async fn next(stream: &mut DeliveryStream) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .ok()
            .flatten()
            .map(|item| item.unwrap())
    }

    #[tokio::test]
    async fn test_prefetch_limits_unsettled_deliveries() {
        let broker = InMemoryBroker::new();
        broker.enqueue("jobs", b"a".to_vec());
        broker.enqueue("jobs", b"b".to_vec());
        let link = open(&broker, None).await;
        let mut stream = link.consume("jobs", "c1", 1).await.unwrap();

        let first = next(&mut stream).await.unwrap();
        assert!(next(&mut stream).await.is_none());

        first.handle.settle(AckDecision::Accept).await.unwrap();
        let second = next(&mut stream).await.unwrap();
        assert_eq!(second.payload, b"b");
        second.handle.settle(AckDecision::Accept).await.unwrap();
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_count() {
        let broker = InMemoryBroker::new();
        broker.enqueue_with_id("jobs", b"a".to_vec(), "msg-1");
        let link = open(&broker, None).await;
        let mut stream = link.consume("jobs", "c1", 1).await.unwrap();

        let first = next(&mut stream).await.unwrap();
        assert!(!first.metadata.redelivered);
        assert_eq!(first.metadata.delivery_count, Some(0));
        first.handle.settle(AckDecision::RejectRequeue).await.unwrap();

        let again = next(&mut stream).await.unwrap();
        assert!(again.metadata.redelivered);
        assert_eq!(again.metadata.delivery_count, Some(1));
        assert_eq!(again.metadata.message_id.as_deref(), Some("msg-1"));
        again.handle.settle(AckDecision::Accept).await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_routes_to_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        broker.enqueue("jobs", b"bad".to_vec());
        let link = open(&broker, Some("jobs.dlq")).await;
        let mut stream = link.consume("jobs", "c1", 1).await.unwrap();

        let delivery = next(&mut stream).await.unwrap();
        delivery.handle.settle(AckDecision::RejectDiscard).await.unwrap();

        assert_eq!(broker.ready("jobs.dlq"), vec![b"bad".to_vec()]);
        assert!(broker.ready("jobs").is_empty());
    }

    #[tokio::test]
    async fn test_discard_without_dead_letter_drops() {
        let broker = InMemoryBroker::new();
        broker.enqueue("jobs", b"bad".to_vec());
        let link = open(&broker, None).await;
        let mut stream = link.consume("jobs", "c1", 1).await.unwrap();

        let delivery = next(&mut stream).await.unwrap();
        delivery.handle.settle(AckDecision::RejectDiscard).await.unwrap();

        assert!(broker.ready("jobs").is_empty());
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_severed_link_ends_stream_with_error() {
        let broker = InMemoryBroker::new();
        broker.enqueue("jobs", b"a".to_vec());
        let link = open(&broker, None).await;
        let mut stream = link.consume("jobs", "c1", 1).await.unwrap();
        let delivery = next(&mut stream).await.unwrap();

        broker.sever_links();

        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::ConnectionLost(_)))
        ));
        assert!(stream.next().await.is_none());
        assert!(delivery.handle.settle(AckDecision::Accept).await.is_err());
        assert_eq!(broker.ready("jobs"), vec![b"a".to_vec()]);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_close_releases_unsettled_messages() {
        let broker = InMemoryBroker::new();
        broker.enqueue("jobs", b"a".to_vec());
        let link = open(&broker, None).await;
        let mut stream = link.consume("jobs", "c1", 1).await.unwrap();
        let delivery = next(&mut stream).await.unwrap();

        link.close().await.unwrap();
        delivery.handle.abandon();

        assert!(stream.next().await.is_none());
        assert_eq!(broker.ready("jobs"), vec![b"a".to_vec()]);
        assert_eq!(broker.open_links(), 0);
        assert_eq!(broker.tracked_links(), 0);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_closing_a_severed_link_forgets_it() {
        let broker = InMemoryBroker::new();
        let link = open(&broker, None).await;

        broker.sever_links();
        assert_eq!(broker.tracked_links(), 1);

        link.close().await.unwrap();
        assert_eq!(broker.tracked_links(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());

        let link = open(&broker, None).await;
        broker.fail_next_publishes(1);
        let message = OutboundMessage {
            payload: b"{}".to_vec(),
            message_id: None,
        };
        assert!(link.publish("out", &message).await.is_err());
        link.publish("out", &message).await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.published("out"), vec![message]);
    }
}
