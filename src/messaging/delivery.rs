use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use super::transport::TransportError;

/// Final acknowledgment outcome for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckDecision {
    Accept,
    RejectRequeue,
    RejectDiscard,
}

impl AckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::RejectRequeue => "reject_requeue",
            Self::RejectDiscard => "reject_discard",
        }
    }
}

impl fmt::Display for AckDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-supplied facts about a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryMetadata {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub redelivered: bool,
    /// Previous delivery attempts, when the broker reports them
    /// (`x-delivery-count` on quorum queues).
    pub delivery_count: Option<u32>,
}

/// Channel-scoped capability to settle one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// Token for one delivery. Settling consumes it, so at most one decision can
/// ever be issued.
pub struct DeliveryHandle {
    delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
    resolved: bool,
}

impl DeliveryHandle {
    pub fn new(delivery_tag: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            acker,
            resolved: false,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub async fn settle(mut self, decision: AckDecision) -> Result<(), TransportError> {
        self.resolved = true;
        debug!(delivery_tag = self.delivery_tag, decision = %decision, "Settling delivery");

        match decision {
            AckDecision::Accept => self.acker.ack().await,
            AckDecision::RejectRequeue => self.acker.reject(true).await,
            AckDecision::RejectDiscard => self.acker.reject(false).await,
        }
    }

    /// Gives up on the delivery without settling it. The broker redelivers it
    /// once the channel closes.
    pub fn abandon(mut self) {
        self.resolved = true;
        debug!(delivery_tag = self.delivery_tag, "Delivery abandoned unsettled");
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(
                delivery_tag = self.delivery_tag,
                "Delivery handle dropped without an acknowledgment decision"
            );
        }
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("delivery_tag", &self.delivery_tag)
            .field("resolved", &self.resolved)
            .finish()
    }
}

/// One message pulled from the input queue.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub metadata: DeliveryMetadata,
    pub handle: DeliveryHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingAcker {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push("ack".into());
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(format!("reject(requeue={requeue})"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_settle_maps_decisions() {
        for (decision, expected) in [
            (AckDecision::Accept, "ack"),
            (AckDecision::RejectRequeue, "reject(requeue=true)"),
            (AckDecision::RejectDiscard, "reject(requeue=false)"),
        ] {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let handle = DeliveryHandle::new(
                1,
                Box::new(RecordingAcker {
                    calls: calls.clone(),
                }),
            );
            handle.settle(decision).await.unwrap();
            assert_eq!(*calls.lock().unwrap(), vec![expected.to_string()]);
        }
    }

    #[test]
    fn test_abandon_issues_no_decision() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handle = DeliveryHandle::new(
            9,
            Box::new(RecordingAcker {
                calls: calls.clone(),
            }),
        );
        handle.abandon();
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_decision_labels() {
        assert_eq!(AckDecision::RejectDiscard.to_string(), "reject_discard");
        assert_eq!(
            serde_json::to_value(AckDecision::RejectRequeue).unwrap(),
            "reject_requeue"
        );
    }
}
