//! Binds a [`ProcessorChain`] to the input queue: every delivery is decoded,
//! run through the chain, settled exactly once and, on success, published to
//! the output queue.

pub mod offline;
pub mod policy;
pub mod report;


use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain::{ChainOutcome, ProcessorChain};
use crate::contracts::{self, Message};
use crate::messaging::{
    AckDecision, Delivery, DeliveryHandle, OutboundMessage, Transport, TransportError,
    TransportPublisher,
};

pub use offline::{OfflineError, process_file};
pub use policy::{AckPolicy, DefaultAckPolicy, FailureDisposition, Verdict};
pub use report::{AckStatus, DeliveryReport, PublishStatus, ReportOutcome, ReportSink, TracingReportSink};

/// Upper bound on how long aborted deliveries get to wind down before their
/// tasks are dropped.
const ABORT_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    /// How long in-flight deliveries may keep running after shutdown starts.
    pub shutdown_grace: Duration,
    pub publish_max_attempts: u32,
    pub publish_retry_delay: Duration,
    /// Stop the runner after this many results in a row could not be
    /// published. Zero never stops.
    pub max_consecutive_publish_failures: u32,
    pub failure: FailureDisposition,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
            publish_max_attempts: 3,
            publish_retry_delay: Duration::from_millis(500),
            max_consecutive_publish_failures: 5,
            failure: FailureDisposition::Discard,
        }
    }
}

pub struct QueueRunner {
    transport: Transport,
    chain: Arc<ProcessorChain>,
    settings: RunnerSettings,
    policy: Arc<dyn AckPolicy>,
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl QueueRunner {
    pub fn new(transport: Transport, chain: Arc<ProcessorChain>, settings: RunnerSettings) -> Self {
        let policy = Arc::new(DefaultAckPolicy::new(settings.failure));
        Self {
            transport,
            chain,
            settings,
            policy,
            sinks: vec![Arc::new(TracingReportSink)],
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AckPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Consumes until `shutdown` fires or the transport gives up, then drains
    /// in-flight deliveries and closes the transport.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RunnerError> {
        let QueueRunner {
            mut transport,
            chain,
            settings,
            policy,
            sinks,
        } = self;

        let input_queue = transport.settings().input_queue.clone();
        let output_queue = transport.settings().output_queue.clone();
        let prefetch = usize::from(transport.settings().prefetch.max(1));

        info!(
            chain = %chain,
            input_queue = %input_queue,
            output_queue = output_queue.as_deref().unwrap_or("none"),
            prefetch,
            "Starting queue runner"
        );

        match transport.connect(&shutdown).await {
            Ok(()) => {}
            Err(TransportError::Cancelled) => {
                info!("Shutdown requested before the transport connected");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "Could not connect transport");
                return Err(e.into());
            }
        }

        if let Err(e) = transport.start_consuming().await {
            warn!(error = %e, "Initial subscription failed, retrying through reconnect");
        }

        let context = Arc::new(DeliveryContext {
            chain,
            policy,
            sinks,
            publisher: transport.publisher(),
            output_queue,
            settings: settings.clone(),
            consecutive_publish_failures: AtomicU32::new(0),
            fatal: CancellationToken::new(),
        });
        let abort = CancellationToken::new();
        let limiter = Arc::new(Semaphore::new(prefetch));
        let mut in_flight = JoinSet::new();

        let result = loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = context.fatal.cancelled() => break Err(context.fatal_error()),
                _ = shutdown.cancelled() => break Ok(()),
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let next = tokio::select! {
                biased;
                _ = context.fatal.cancelled() => break Err(context.fatal_error()),
                next = transport.next_delivery(&shutdown) => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let context = context.clone();
                    let abort = abort.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        context.process(delivery, &abort).await;
                    });
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    error!(error = %e, "Transport failed");
                    break Err(RunnerError::Transport(e));
                }
            }
        };

        info!(in_flight = in_flight.len(), "Stopping queue runner");
        transport.stop_consuming().await;
        drain(&mut in_flight, settings.shutdown_grace, &abort).await;

        if let Err(e) = transport.shutdown().await {
            warn!(error = %e, "Transport did not shut down cleanly");
        }

        info!("Queue runner stopped");
        result
    }
}

struct DeliveryContext {
    chain: Arc<ProcessorChain>,
    policy: Arc<dyn AckPolicy>,
    sinks: Vec<Arc<dyn ReportSink>>,
    publisher: TransportPublisher,
    output_queue: Option<String>,
    settings: RunnerSettings,
    consecutive_publish_failures: AtomicU32,
    fatal: CancellationToken,
}

impl DeliveryContext {
    async fn process(&self, delivery: Delivery, abort: &CancellationToken) -> DeliveryReport {
        let started = Instant::now();
        let Delivery {
            payload,
            metadata,
            handle,
        } = delivery;

        debug!(
            delivery_tag = metadata.delivery_tag,
            payload_size = payload.len(),
            redelivered = metadata.redelivered,
            "Processing delivery"
        );

        let mut report = DeliveryReport::new(self.chain.name(), &metadata, &payload);

        let message = match contracts::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                let decision = self.policy.decide(Verdict::DecodeError(&e), &metadata);
                report.outcome = ReportOutcome::DecodeError { reason: e.reason() };
                report.ack = settle(handle, decision).await;
                return self.finish(report, started);
            }
        };

        let result = match self.chain.run_cancellable(message, abort).await {
            Ok(result) => result,
            Err(aborted) => {
                handle.abandon();
                report.outcome = ReportOutcome::Aborted { step: aborted.step };
                report.timings = aborted.timings;
                report.ack = AckStatus::Abandoned;
                return self.finish(report, started);
            }
        };

        let decision = self.policy.decide(Verdict::Chain(&result.outcome), &metadata);
        report.timings = result.timings;
        report.ack = settle(handle, decision).await;

        match result.outcome {
            ChainOutcome::Completed(output) => {
                report.outcome = ReportOutcome::Completed;
                let acknowledged = report.ack
                    == AckStatus::Settled {
                        decision: AckDecision::Accept,
                    };
                if let Some(queue) = &self.output_queue {
                    if acknowledged {
                        report.publish = self.publish(queue, &output, metadata.message_id).await;
                    } else {
                        warn!(
                            delivery_tag = metadata.delivery_tag,
                            "Input was not acknowledged, result not published"
                        );
                    }
                }
            }
            ChainOutcome::Dropped { step } => {
                report.outcome = ReportOutcome::Dropped { step };
            }
            ChainOutcome::Failed {
                step,
                cause,
                handler_error,
            } => {
                report.outcome = ReportOutcome::Failed {
                    step,
                    cause,
                    handler_error: handler_error.map(|e| e.to_string()),
                };
            }
        }

        self.finish(report, started)
    }

    /// Publishes a chain result with bounded retries. The input is already
    /// acknowledged at this point, so a final failure is reported loudly and
    /// counted towards the consecutive-failure limit.
    async fn publish(
        &self,
        queue: &str,
        output: &Message,
        message_id: Option<String>,
    ) -> PublishStatus {
        let payload = match contracts::encode(output) {
            Ok(payload) => payload,
            Err(e) => {
                return PublishStatus::Failed {
                    queue: queue.to_string(),
                    attempts: 0,
                    reason: e.to_string(),
                };
            }
        };

        let message = OutboundMessage {
            payload,
            message_id: Some(message_id.unwrap_or_else(|| Uuid::new_v4().to_string())),
        };

        let max_attempts = self.settings.publish_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.publisher.publish(queue, &message).await {
                Ok(()) => {
                    self.consecutive_publish_failures.store(0, Ordering::SeqCst);
                    return PublishStatus::Published {
                        queue: queue.to_string(),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(attempt, max_attempts, queue, error = %e, "Publish attempt failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.settings.publish_retry_delay).await;
                    }
                }
            }
        }

        let consecutive = self.consecutive_publish_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.settings.max_consecutive_publish_failures;
        if limit > 0 && consecutive >= limit {
            error!(consecutive, limit, "Too many consecutive publish failures, stopping runner");
            self.fatal.cancel();
        }

        PublishStatus::Failed {
            queue: queue.to_string(),
            attempts: max_attempts,
            reason: last_error,
        }
    }

    fn finish(&self, mut report: DeliveryReport, started: Instant) -> DeliveryReport {
        report.elapsed_ms = started.elapsed().as_micros() as f64 / 1000.0;
        for sink in &self.sinks {
            sink.record(&report);
        }
        report
    }

    fn fatal_error(&self) -> RunnerError {
        RunnerError::PublishFailures {
            consecutive: self.consecutive_publish_failures.load(Ordering::SeqCst),
        }
    }
}

async fn settle(handle: DeliveryHandle, decision: AckDecision) -> AckStatus {
    let delivery_tag = handle.delivery_tag();
    match handle.settle(decision).await {
        Ok(()) => AckStatus::Settled { decision },
        Err(e) => {
            error!(delivery_tag, decision = %decision, error = %e, "Failed to settle delivery");
            AckStatus::Failed {
                decision,
                reason: e.to_string(),
            }
        }
    }
}

/// Waits for in-flight deliveries. Whatever is still running when the grace
/// period ends is aborted and left unsettled for the broker to redeliver.
/// Tasks that do not react to the abort token within [`ABORT_WAIT`] are
/// dropped; their handles go with them, unsettled.
async fn drain(in_flight: &mut JoinSet<()>, grace: Duration, abort: &CancellationToken) {
    if in_flight.is_empty() {
        return;
    }

    info!(
        in_flight = in_flight.len(),
        grace_ms = grace.as_millis() as u64,
        "Waiting for in-flight deliveries"
    );

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = in_flight.len(),
            "Grace period elapsed, abandoning in-flight deliveries"
        );
        abort.cancel();

        let settled = tokio::time::timeout(ABORT_WAIT, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if settled.is_err() {
            warn!(
                remaining = in_flight.len(),
                "In-flight deliveries ignored the abort, dropping them"
            );
            in_flight.abort_all();
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        }
    }
}

fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("Delivery task dropped during shutdown"),
        Err(e) => error!(error = %e, "Delivery task failed"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Stopped after {consecutive} consecutive publish failures")]
    PublishFailures { consecutive: u32 },
}
