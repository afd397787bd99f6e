//! Ordered processor chains.
//!
//! A [`ProcessorChain`] is built once at startup and then shared read-only
//! (usually behind an `Arc`) by every concurrent execution. Mutating methods
//! take `&mut self`, so a chain that is already shared cannot be changed.

mod executor;
pub mod result;
pub mod step;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use result::{ChainAborted, ChainOutcome, ChainResult, StepTiming};
pub use step::{
    AsyncFnStep, ErrorHandler, FnErrorHandler, FnStep, Step, StepOutput, async_step_fn,
    error_handler_fn, step_fn,
};

/// A named step plus its per-step settings.
pub struct ChainStep {
    name: String,
    description: Option<String>,
    timeout: Option<Duration>,
    step: Arc<dyn Step>,
}

impl ChainStep {
    pub fn new(name: impl Into<String>, step: impl Step + 'static) -> Self {
        Self::from_arc(name, Arc::new(step))
    }

    pub fn from_arc(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            timeout: None,
            step,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Overrides the chain-wide step timeout for this step only.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

pub struct ProcessorChain {
    name: String,
    steps: Vec<ChainStep>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    step_timeout: Option<Duration>,
}

impl ProcessorChain {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        info!(chain = %name, "Created processor chain");
        Self {
            name,
            steps: Vec::new(),
            error_handler: None,
            step_timeout: None,
        }
    }

    /// Default time limit for every step; `None` lets steps run unbounded.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn add_step(
        &mut self,
        name: impl Into<String>,
        step: impl Step + 'static,
    ) -> Result<&mut Self, ChainError> {
        self.push(ChainStep::new(name, step))
    }

    pub fn push(&mut self, entry: ChainStep) -> Result<&mut Self, ChainError> {
        if self.steps.iter().any(|existing| existing.name == entry.name) {
            return Err(ChainError::DuplicateStepName(entry.name));
        }

        info!(
            chain = %self.name,
            step = %entry.name,
            position = self.steps.len(),
            description = entry.description.as_deref().unwrap_or(""),
            "Added step to chain"
        );
        self.steps.push(entry);
        Ok(self)
    }

    pub fn set_error_handler(&mut self, handler: impl ErrorHandler + 'static) -> &mut Self {
        self.set_shared_error_handler(Arc::new(handler))
    }

    pub fn set_shared_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) -> &mut Self {
        info!(chain = %self.name, "Set error handler");
        self.error_handler = Some(handler);
        self
    }

    /// Removes every step and the error handler.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.error_handler = None;
        info!(chain = %self.name, "Reset processor chain");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(ChainStep::name).collect()
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn has_error_handler(&self) -> bool {
        self.error_handler.is_some()
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
    }
}

impl fmt::Display for ProcessorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<ProcessorChain name={} steps=[{}]>",
            self.name,
            self.step_names().join(", ")
        )
    }
}

impl fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorChain")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("has_error_handler", &self.has_error_handler())
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Step name already present in chain: {0}")]
    DuplicateStepName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn passthrough() -> impl Step {
        step_fn(|m| Ok(StepOutput::Forward(m)))
    }

    #[test]
    fn test_add_step_keeps_insertion_order() {
        let mut chain = ProcessorChain::new("ordered");
        chain
            .add_step("first", passthrough())
            .unwrap()
            .add_step("second", passthrough())
            .unwrap()
            .add_step("third", passthrough())
            .unwrap();

        assert_eq!(chain.step_names(), vec!["first", "second", "third"]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_duplicate_step_name_is_rejected() {
        let mut chain = ProcessorChain::new("dupes");
        chain.add_step("enrich", passthrough()).unwrap();

        let err = chain.add_step("enrich", passthrough()).unwrap_err();
        assert_eq!(err, ChainError::DuplicateStepName("enrich".into()));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_descriptor_settings() {
        let entry = ChainStep::new("slow", passthrough())
            .with_description("talks to a remote service")
            .with_timeout(Duration::from_secs(2));

        assert_eq!(entry.name(), "slow");
        assert_eq!(entry.description(), Some("talks to a remote service"));
        assert_eq!(entry.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_reset_clears_steps_and_handler() {
        let mut chain = ProcessorChain::new("resettable");
        chain.add_step("a", passthrough()).unwrap();
        chain.set_error_handler(error_handler_fn(|_, _, _| Ok(())));

        chain.reset();

        assert!(chain.is_empty());
        assert!(!chain.has_error_handler());
        // Names are free again after a reset.
        chain.add_step("a", passthrough()).unwrap();
    }

    #[test]
    fn test_display_lists_steps() {
        let mut chain = ProcessorChain::new("sample_chain");
        chain.add_step("timestamp", passthrough()).unwrap();
        chain.add_step("uppercase", passthrough()).unwrap();

        assert_eq!(
            chain.to_string(),
            "<ProcessorChain name=sample_chain steps=[timestamp, uppercase]>"
        );
    }

    #[tokio::test]
    async fn test_empty_chain_completes_with_input() {
        let chain = ProcessorChain::new("empty");
        let result = chain.run(json!({"a": 1})).await;

        assert_eq!(result.outcome, ChainOutcome::Completed(json!({"a": 1})));
        assert!(result.timings.is_empty());
    }
}
