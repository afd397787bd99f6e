use serde::Serialize;
use tracing::{error, info, warn};

use crate::chain::StepTiming;
use crate::contracts::{StepError, excerpt};
use crate::messaging::{AckDecision, DeliveryMetadata};

const EXCERPT_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReportOutcome {
    Completed,
    Dropped {
        step: String,
    },
    Failed {
        step: String,
        cause: StepError,
        handler_error: Option<String>,
    },
    DecodeError {
        reason: String,
    },
    /// Shutdown abandoned the execution mid-chain.
    Aborted {
        step: String,
    },
}

impl ReportOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Dropped { .. } => "dropped",
            Self::Failed { .. } => "failed",
            Self::DecodeError { .. } => "decode_error",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckStatus {
    Pending,
    Settled { decision: AckDecision },
    Failed { decision: AckDecision, reason: String },
    Abandoned,
}

impl AckStatus {
    pub fn decision(&self) -> Option<AckDecision> {
        match self {
            Self::Settled { decision } | Self::Failed { decision, .. } => Some(*decision),
            Self::Pending | Self::Abandoned => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishStatus {
    Skipped,
    Published {
        queue: String,
        attempts: u32,
    },
    Failed {
        queue: String,
        attempts: u32,
        reason: String,
    },
}

/// Everything known about one delivery once the runner is done with it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub chain: String,
    pub queue: String,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    /// Payload excerpt, kept only when the message has no id.
    pub excerpt: Option<String>,
    pub redelivered: bool,
    pub outcome: ReportOutcome,
    pub timings: Vec<StepTiming>,
    pub ack: AckStatus,
    pub publish: PublishStatus,
    pub elapsed_ms: f64,
}

impl DeliveryReport {
    pub fn new(chain: &str, metadata: &DeliveryMetadata, payload: &[u8]) -> Self {
        Self {
            chain: chain.to_string(),
            queue: metadata.routing_key.clone(),
            delivery_tag: metadata.delivery_tag,
            message_id: metadata.message_id.clone(),
            excerpt: metadata
                .message_id
                .is_none()
                .then(|| excerpt(payload, EXCERPT_CHARS)),
            redelivered: metadata.redelivered,
            outcome: ReportOutcome::Completed,
            timings: Vec::new(),
            ack: AckStatus::Pending,
            publish: PublishStatus::Skipped,
            elapsed_ms: 0.0,
        }
    }

    /// Message id, or the payload excerpt when there is none.
    pub fn identity(&self) -> &str {
        self.message_id
            .as_deref()
            .or(self.excerpt.as_deref())
            .unwrap_or("")
    }
}

/// Receives a report for every delivery the runner finishes with.
pub trait ReportSink: Send + Sync {
    fn record(&self, report: &DeliveryReport);
}

/// Logs each report as one structured event.
pub struct TracingReportSink;

impl ReportSink for TracingReportSink {
    fn record(&self, report: &DeliveryReport) {
        let timings = serde_json::to_string(&report.timings).unwrap_or_default();
        let decision = report.ack.decision().map(|d| d.as_str()).unwrap_or("none");

        match &report.outcome {
            ReportOutcome::Completed | ReportOutcome::Dropped { .. } => info!(
                chain = %report.chain,
                delivery_tag = report.delivery_tag,
                message_ref = report.identity(),
                outcome = report.outcome.label(),
                decision,
                elapsed_ms = report.elapsed_ms,
                timings = %timings,
                "Delivery processed"
            ),
            ReportOutcome::Aborted { step } => warn!(
                chain = %report.chain,
                delivery_tag = report.delivery_tag,
                message_ref = report.identity(),
                step = %step,
                "Delivery abandoned during shutdown"
            ),
            ReportOutcome::Failed {
                step,
                cause,
                handler_error,
            } => error!(
                chain = %report.chain,
                delivery_tag = report.delivery_tag,
                message_ref = report.identity(),
                step = %step,
                error_type = cause.error_type(),
                error = %cause,
                handler_error = handler_error.as_deref().unwrap_or("none"),
                decision,
                redelivered = report.redelivered,
                timings = %timings,
                "Delivery failed"
            ),
            ReportOutcome::DecodeError { reason } => error!(
                chain = %report.chain,
                delivery_tag = report.delivery_tag,
                message_ref = report.identity(),
                error = %reason,
                decision,
                "Delivery could not be decoded"
            ),
        }

        if let AckStatus::Failed { reason, .. } = &report.ack {
            error!(
                delivery_tag = report.delivery_tag,
                decision,
                error = %reason,
                "Acknowledgment failed; broker will redeliver"
            );
        }

        if let PublishStatus::Failed {
            queue,
            attempts,
            reason,
        } = &report.publish
        {
            error!(
                delivery_tag = report.delivery_tag,
                message_ref = report.identity(),
                queue = %queue,
                attempts,
                error = %reason,
                "Result could not be published after the input was acknowledged"
            );
        }
    }
}
