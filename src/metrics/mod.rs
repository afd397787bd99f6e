use prometheus::{
    CounterVec, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::messaging::TransportState;
use crate::runner::{AckStatus, DeliveryReport, PublishStatus, ReportSink};

pub mod server;

const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0];

pub struct Metrics {
    pub messages_total: IntCounterVec,
    pub ack_decisions_total: IntCounterVec,
    pub step_duration_seconds: HistogramVec,
    pub message_duration_seconds: HistogramVec,
    pub publish_failures_total: CounterVec,
    pub transport_reconnects_total: IntCounter,
    pub transport_state: Gauge,
    pub active_consumers: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            Opts::new(
                "queue_chain_messages_total",
                "Deliveries handled, by processing outcome",
            ),
            &["queue", "outcome"],
        )?;

        let ack_decisions_total = IntCounterVec::new(
            Opts::new(
                "queue_chain_ack_decisions_total",
                "Acknowledgment decisions issued to the broker",
            ),
            &["decision"],
        )?;

        let step_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "queue_chain_step_duration_seconds",
                "Time spent in each chain step",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["step"],
        )?;

        let message_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "queue_chain_message_duration_seconds",
                "Time from delivery to settlement and publish",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["queue", "outcome"],
        )?;

        let publish_failures_total = CounterVec::new(
            Opts::new(
                "queue_chain_publish_failures_total",
                "Results that could not be published after retries",
            ),
            &["queue"],
        )?;

        let transport_reconnects_total = IntCounter::new(
            "queue_chain_transport_reconnects_total",
            "Times the transport lost its link and started reconnecting",
        )?;

        let transport_state = Gauge::new(
            "queue_chain_transport_state",
            "Transport state (0 disconnected, 1 connecting, 2 connected, 3 consuming, 4 reconnecting)",
        )?;

        let active_consumers = Gauge::new(
            "queue_chain_active_consumers",
            "Number of active queue consumers",
        )?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(ack_decisions_total.clone()))?;
        registry.register(Box::new(step_duration_seconds.clone()))?;
        registry.register(Box::new(message_duration_seconds.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(transport_reconnects_total.clone()))?;
        registry.register(Box::new(transport_state.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;

        Ok(Arc::new(Self {
            messages_total,
            ack_decisions_total,
            step_duration_seconds,
            message_duration_seconds,
            publish_failures_total,
            transport_reconnects_total,
            transport_state,
            active_consumers,
            registry,
        }))
    }

    pub fn observe_state(&self, state: TransportState) {
        self.transport_state.set(state.as_gauge());
        self.active_consumers
            .set(if state == TransportState::Consuming { 1.0 } else { 0.0 });
        if state == TransportState::Reconnecting {
            self.transport_reconnects_total.inc();
        }
    }

    /// Mirrors transport state changes into the gauges until the transport
    /// goes away.
    pub fn track_transport(self: &Arc<Self>, mut states: watch::Receiver<TransportState>) {
        let metrics = self.clone();
        tokio::spawn(async move {
            metrics.observe_state(*states.borrow_and_update());
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                metrics.observe_state(state);
            }
            debug!("Transport state channel closed");
        });
    }
}

impl ReportSink for Metrics {
    fn record(&self, report: &DeliveryReport) {
        let outcome = report.outcome.label();

        self.messages_total
            .with_label_values(&[&report.queue, outcome])
            .inc();
        self.message_duration_seconds
            .with_label_values(&[&report.queue, outcome])
            .observe(report.elapsed_ms / 1000.0);

        for timing in &report.timings {
            self.step_duration_seconds
                .with_label_values(&[&timing.step])
                .observe(timing.duration.as_secs_f64());
        }

        if let AckStatus::Settled { decision } = &report.ack {
            self.ack_decisions_total
                .with_label_values(&[decision.as_str()])
                .inc();
        }

        if let PublishStatus::Failed { queue, .. } = &report.publish {
            self.publish_failures_total.with_label_values(&[queue]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StepTiming;
    use crate::messaging::{AckDecision, DeliveryMetadata};
    use crate::runner::ReportOutcome;
    use std::time::Duration;

    fn report() -> DeliveryReport {
        let metadata = DeliveryMetadata {
            delivery_tag: 1,
            routing_key: "chain_input".to_string(),
            ..Default::default()
        };
        let mut report = DeliveryReport::new("pipeline", &metadata, b"{}");
        report.timings = vec![StepTiming {
            step: "counter".to_string(),
            duration: Duration::from_millis(3),
        }];
        report.ack = AckStatus::Settled {
            decision: AckDecision::Accept,
        };
        report.publish = PublishStatus::Failed {
            queue: "chain_output".to_string(),
            attempts: 3,
            reason: "not connected".to_string(),
        };
        report
    }

    #[test]
    fn test_report_updates_counters() {
        let metrics = Metrics::new().unwrap();

        metrics.record(&report());
        let mut dropped = report();
        dropped.outcome = ReportOutcome::Dropped {
            step: "filter".to_string(),
        };
        metrics.record(&dropped);

        assert_eq!(
            metrics
                .messages_total
                .with_label_values(&["chain_input", "completed"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .messages_total
                .with_label_values(&["chain_input", "dropped"])
                .get(),
            1
        );
        assert_eq!(
            metrics.ack_decisions_total.with_label_values(&["accept"]).get(),
            2
        );
        assert_eq!(
            metrics
                .step_duration_seconds
                .with_label_values(&["counter"])
                .get_sample_count(),
            2
        );
        assert_eq!(
            metrics
                .publish_failures_total
                .with_label_values(&["chain_output"])
                .get(),
            2.0
        );
    }

    #[test]
    fn test_state_gauges() {
        let metrics = Metrics::new().unwrap();

        metrics.observe_state(TransportState::Consuming);
        assert_eq!(metrics.transport_state.get(), 3.0);
        assert_eq!(metrics.active_consumers.get(), 1.0);

        metrics.observe_state(TransportState::Reconnecting);
        assert_eq!(metrics.active_consumers.get(), 0.0);
        assert_eq!(metrics.transport_reconnects_total.get(), 1);
    }

    #[test]
    fn test_registry_exposes_metric_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record(&report());

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.contains(&"queue_chain_messages_total".to_string()));
        assert!(names.contains(&"queue_chain_transport_state".to_string()));
    }
}
