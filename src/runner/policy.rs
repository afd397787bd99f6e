use crate::chain::ChainOutcome;
use crate::contracts::DecodeError;
use crate::messaging::{AckDecision, DeliveryMetadata};

/// What happened to a delivery before it is settled.
#[derive(Debug, Clone, Copy)]
pub enum Verdict<'a> {
    Chain(&'a ChainOutcome),
    DecodeError(&'a DecodeError),
}

/// Maps a processing verdict to an acknowledgment decision.
pub trait AckPolicy: Send + Sync {
    fn decide(&self, verdict: Verdict<'_>, metadata: &DeliveryMetadata) -> AckDecision;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureDisposition {
    #[default]
    Discard,
    /// Requeue failed messages until they have been redelivered
    /// `max_redeliveries` times, then discard.
    Requeue { max_redeliveries: u32 },
}

/// Completed and dropped messages are accepted. Undecodable messages and
/// unrecoverable failures are always discarded; other failures follow
/// `on_failure`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAckPolicy {
    pub on_failure: FailureDisposition,
}

impl DefaultAckPolicy {
    pub fn new(on_failure: FailureDisposition) -> Self {
        Self { on_failure }
    }
}

impl AckPolicy for DefaultAckPolicy {
    fn decide(&self, verdict: Verdict<'_>, metadata: &DeliveryMetadata) -> AckDecision {
        let outcome = match verdict {
            Verdict::DecodeError(_) => return AckDecision::RejectDiscard,
            Verdict::Chain(outcome) => outcome,
        };

        match outcome {
            ChainOutcome::Completed(_) | ChainOutcome::Dropped { .. } => AckDecision::Accept,
            ChainOutcome::Failed { .. } if outcome.is_unrecoverable() => AckDecision::RejectDiscard,
            ChainOutcome::Failed { .. } => match self.on_failure {
                FailureDisposition::Discard => AckDecision::RejectDiscard,
                FailureDisposition::Requeue { max_redeliveries } => {
                    if previous_deliveries(metadata) < max_redeliveries {
                        AckDecision::RejectRequeue
                    } else {
                        AckDecision::RejectDiscard
                    }
                }
            },
        }
    }
}

/// Classic queues only say whether a message was redelivered, not how often,
/// so a redelivered message without a count is treated as out of retries.
fn previous_deliveries(metadata: &DeliveryMetadata) -> u32 {
    match metadata.delivery_count {
        Some(count) => count,
        None if metadata.redelivered => u32::MAX,
        None => 0,
    }
}
