//! Stock steps the binary can assemble into a chain by name.
//!
//! Steps other than `require_object` pass non-object messages through
//! untouched.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::chain::{ChainError, ChainStep, ErrorHandler, ProcessorChain, Step, StepOutput};
use crate::contracts::{ErrorHandlerError, Message, StepError};

/// Names and descriptions of every stock step.
pub const CATALOG: &[(&str, &str)] = &[
    ("require_object", "Fail unless the message is a JSON object"),
    ("timestamp", "Set processed_at to the current epoch time in seconds"),
    ("uppercase", "Uppercase every top-level string value"),
    ("counter", "Increment processing_steps"),
    (
        "priority_filter",
        "Keep messages with priority >= 5 or from critical-system, drop the rest",
    ),
];

pub struct RequireObject;

#[async_trait]
impl Step for RequireObject {
    async fn execute(&self, message: Message) -> Result<StepOutput, StepError> {
        if message.is_object() {
            Ok(StepOutput::Forward(message))
        } else {
            Err(StepError::failed(format!(
                "expected a JSON object, got {}",
                kind(&message)
            )))
        }
    }
}

pub struct Timestamp;

#[async_trait]
impl Step for Timestamp {
    async fn execute(&self, mut message: Message) -> Result<StepOutput, StepError> {
        if let Some(fields) = message.as_object_mut() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| StepError::failed(format!("system clock before epoch: {e}")))?;
            fields.insert("processed_at".to_string(), json!(now.as_secs_f64()));
        }
        Ok(StepOutput::Forward(message))
    }
}

pub struct Uppercase;

#[async_trait]
impl Step for Uppercase {
    async fn execute(&self, mut message: Message) -> Result<StepOutput, StepError> {
        if let Some(fields) = message.as_object_mut() {
            for value in fields.values_mut() {
                if let Value::String(s) = value {
                    *s = s.to_uppercase();
                }
            }
        }
        Ok(StepOutput::Forward(message))
    }
}

pub struct Counter;

#[async_trait]
impl Step for Counter {
    async fn execute(&self, mut message: Message) -> Result<StepOutput, StepError> {
        if let Some(fields) = message.as_object_mut() {
            let count = fields
                .get("processing_steps")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            fields.insert("processing_steps".to_string(), json!(count + 1));
        }
        Ok(StepOutput::Forward(message))
    }
}

pub struct PriorityFilter {
    pub min_priority: i64,
    pub bypass_source: String,
}

impl Default for PriorityFilter {
    fn default() -> Self {
        Self {
            min_priority: 5,
            bypass_source: "critical-system".to_string(),
        }
    }
}

#[async_trait]
impl Step for PriorityFilter {
    async fn execute(&self, message: Message) -> Result<StepOutput, StepError> {
        let Some(fields) = message.as_object() else {
            return Ok(StepOutput::Forward(message));
        };

        let priority = fields.get("priority").and_then(Value::as_i64).unwrap_or(0);
        let source = fields.get("source").and_then(Value::as_str);

        if priority >= self.min_priority || source == Some(self.bypass_source.as_str()) {
            Ok(StepOutput::Forward(message))
        } else {
            Ok(StepOutput::Drop)
        }
    }
}

/// Logs the failing step and cause.
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn on_error(
        &self,
        message: &Message,
        step: &str,
        cause: &StepError,
    ) -> Result<(), ErrorHandlerError> {
        let id = message.get("id").map(Value::to_string).unwrap_or_default();
        warn!(
            step,
            error_type = cause.error_type(),
            error = %cause,
            message_field_id = %id,
            "Step failed"
        );
        Ok(())
    }
}

pub fn catalog_step(name: &str) -> Option<ChainStep> {
    let step = match name {
        "require_object" => ChainStep::new(name, RequireObject),
        "timestamp" => ChainStep::new(name, Timestamp),
        "uppercase" => ChainStep::new(name, Uppercase),
        "counter" => ChainStep::new(name, Counter),
        "priority_filter" => ChainStep::new(name, PriorityFilter::default()),
        _ => return None,
    };

    let description = CATALOG
        .iter()
        .find(|(entry, _)| *entry == name)
        .map(|(_, description)| *description)
        .unwrap_or_default();
    Some(step.with_description(description))
}

/// Builds a chain from catalog step names, in order, with the logging error
/// handler attached.
pub fn build_chain(
    name: &str,
    step_names: &[String],
    step_timeout: Option<Duration>,
) -> Result<ProcessorChain, CatalogError> {
    if step_names.is_empty() {
        return Err(CatalogError::EmptyChain);
    }

    let mut chain = ProcessorChain::new(name).with_step_timeout(step_timeout);
    for step_name in step_names {
        let step = catalog_step(step_name)
            .ok_or_else(|| CatalogError::UnknownStep(step_name.clone()))?;
        chain.push(step)?;
    }
    chain.set_error_handler(LoggingErrorHandler);

    Ok(chain)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("A chain needs at least one step")]
    EmptyChain,

    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainOutcome;
    use pretty_assertions::assert_eq;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn forward(step: impl Step, message: Value) -> Value {
        match step.execute(message).await.unwrap() {
            StepOutput::Forward(message) => message,
            StepOutput::Drop => panic!("message was dropped"),
        }
    }

    #[tokio::test]
    async fn test_require_object() {
        assert!(RequireObject.execute(json!({"a": 1})).await.is_ok());
        let err = RequireObject.execute(json!([1, 2])).await.unwrap_err();
        assert_eq!(err.reason(), "expected a JSON object, got array");
    }

    #[tokio::test]
    async fn test_uppercase_touches_only_top_level_strings() {
        let out = forward(Uppercase, json!({"a": "x", "n": 3, "nested": {"b": "y"}})).await;
        assert_eq!(out, json!({"a": "X", "n": 3, "nested": {"b": "y"}}));
    }

    #[tokio::test]
    async fn test_counter_increments() {
        assert_eq!(forward(Counter, json!({})).await, json!({"processing_steps": 1}));
        assert_eq!(
            forward(Counter, json!({"processing_steps": 4})).await,
            json!({"processing_steps": 5})
        );
        assert_eq!(forward(Counter, json!("text")).await, json!("text"));
    }

    #[tokio::test]
    async fn test_timestamp_sets_processed_at() {
        let out = forward(Timestamp, json!({"a": 1})).await;
        assert!(out["processed_at"].as_f64().unwrap() > 1_600_000_000.0);
    }

    #[tokio::test]
    async fn test_priority_filter() {
        let filter = PriorityFilter::default();
        assert_eq!(
            filter.execute(json!({"priority": 7})).await.unwrap(),
            StepOutput::Forward(json!({"priority": 7}))
        );
        assert_eq!(
            filter.execute(json!({"priority": 1})).await.unwrap(),
            StepOutput::Drop
        );
        assert!(matches!(
            filter
                .execute(json!({"priority": 1, "source": "critical-system"}))
                .await
                .unwrap(),
            StepOutput::Forward(_)
        ));
        assert_eq!(filter.execute(json!({})).await.unwrap(), StepOutput::Drop);
    }

    #[tokio::test]
    async fn test_build_chain_in_order() {
        let chain = build_chain("pipeline", &names(&["require_object", "counter", "uppercase"]), None)
            .unwrap();

        assert_eq!(chain.step_names(), vec!["require_object", "counter", "uppercase"]);
        assert!(chain.has_error_handler());

        let result = chain.run(json!({"title": "hi"})).await;
        assert_eq!(
            result.outcome,
            ChainOutcome::Completed(json!({"title": "HI", "processing_steps": 1}))
        );
    }

    #[test]
    fn test_build_chain_rejects_unknown_and_duplicate_steps() {
        assert!(matches!(
            build_chain("p", &names(&["nope"]), None),
            Err(CatalogError::UnknownStep(name)) if name == "nope"
        ));
        assert!(matches!(
            build_chain("p", &names(&["counter", "counter"]), None),
            Err(CatalogError::Chain(ChainError::DuplicateStepName(_)))
        ));
        assert!(matches!(build_chain("p", &[], None), Err(CatalogError::EmptyChain)));
    }

    #[test]
    fn test_every_catalog_entry_resolves() {
        for (name, _) in CATALOG {
            let step = catalog_step(name).unwrap();
            assert_eq!(step.name(), *name);
            assert!(step.description().is_some());
        }
    }
}
