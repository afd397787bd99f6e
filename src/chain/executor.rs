use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::result::{ChainAborted, ChainOutcome, ChainResult, StepTiming};
use super::step::{ErrorHandler, StepOutput};
use super::{ChainStep, ProcessorChain};
use crate::contracts::{ErrorHandlerError, Message, StepError};

impl ProcessorChain {
    /// Runs `message` through every step in insertion order.
    pub async fn run(&self, message: Message) -> ChainResult {
        let never = CancellationToken::new();
        self.run_cancellable(message, &never)
            .await
            .unwrap_or_else(|aborted| ChainResult {
                outcome: ChainOutcome::Failed {
                    step: aborted.step,
                    cause: StepError::failed("execution aborted"),
                    handler_error: None,
                },
                timings: aborted.timings,
            })
    }

    /// Like [`run`](Self::run), but stops as soon as `cancel` fires.
    ///
    /// The token is checked before each step and raced against the running
    /// step and the error handler. An aborted execution has no outcome: the caller must leave the
    /// delivery unsettled so the broker redelivers it.
    pub async fn run_cancellable(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<ChainResult, ChainAborted> {
        let started = Instant::now();
        let mut timings = Vec::with_capacity(self.steps.len());
        let mut current = message;

        debug!(chain = %self.name, steps = self.steps.len(), "Starting chain execution");

        for entry in &self.steps {
            if cancel.is_cancelled() {
                return Err(self.aborted(entry, timings));
            }

            // The error handler sees the input of the failing step.
            let before = self.error_handler.as_ref().map(|_| current.clone());

            let step_started = Instant::now();
            let invoked = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.invoke(entry, current) => Some(result),
            };
            let elapsed = step_started.elapsed();
            timings.push(StepTiming {
                step: entry.name.clone(),
                duration: elapsed,
            });

            let Some(result) = invoked else {
                return Err(self.aborted(entry, timings));
            };

            match result {
                Ok(StepOutput::Forward(next)) => {
                    debug!(
                        chain = %self.name,
                        step = %entry.name,
                        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                        "Step completed"
                    );
                    current = next;
                }
                Ok(StepOutput::Drop) => {
                    debug!(chain = %self.name, step = %entry.name, "Message dropped by step");
                    return Ok(ChainResult {
                        outcome: ChainOutcome::Dropped {
                            step: entry.name.clone(),
                        },
                        timings,
                    });
                }
                Err(cause) => {
                    error!(
                        chain = %self.name,
                        step = %entry.name,
                        error_type = cause.error_type(),
                        error = %cause,
                        "Step failed"
                    );

                    let handler_error = match (&self.error_handler, before) {
                        (Some(handler), Some(before)) => {
                            let notified = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => None,
                                failure = self.notify_handler(handler, &before, &entry.name, &cause) => Some(failure),
                            };
                            match notified {
                                Some(failure) => failure,
                                None => return Err(self.aborted(entry, timings)),
                            }
                        }
                        _ => None,
                    };

                    return Ok(ChainResult {
                        outcome: ChainOutcome::Failed {
                            step: entry.name.clone(),
                            cause,
                            handler_error,
                        },
                        timings,
                    });
                }
            }
        }

        debug!(
            chain = %self.name,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Chain execution completed"
        );

        Ok(ChainResult {
            outcome: ChainOutcome::Completed(current),
            timings,
        })
    }

    async fn invoke(&self, entry: &ChainStep, message: Message) -> Result<StepOutput, StepError> {
        let guarded = AssertUnwindSafe(entry.step.execute(message)).catch_unwind();

        let caught = match entry.timeout.or(self.step_timeout) {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(caught) => caught,
                Err(_) => return Err(StepError::timeout(limit)),
            },
            None => guarded.await,
        };

        caught.unwrap_or_else(|panic| Err(StepError::panicked(panic_message(panic.as_ref()))))
    }

    async fn notify_handler(
        &self,
        handler: &Arc<dyn ErrorHandler>,
        message: &Message,
        step: &str,
        cause: &StepError,
    ) -> Option<ErrorHandlerError> {
        let caught = AssertUnwindSafe(handler.on_error(message, step, cause))
            .catch_unwind()
            .await;

        let failure = match caught {
            Ok(Ok(())) => return None,
            Ok(Err(e)) => e,
            Err(panic) => ErrorHandlerError::new(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        error!(
            chain = %self.name,
            step,
            error = %failure,
            "Error handler failed, execution is unrecoverable"
        );
        Some(failure)
    }

    fn aborted(&self, entry: &ChainStep, timings: Vec<StepTiming>) -> ChainAborted {
        warn!(chain = %self.name, step = %entry.name, "Chain execution aborted");
        ChainAborted {
            step: entry.name.clone(),
            timings,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
