//! Runs a chain over a single JSON file instead of a queue.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::chain::{ChainOutcome, ChainResult, ProcessorChain};
use crate::contracts::{self, DecodeError};

/// Reads one message from `input`, runs it through `chain` and, when the chain
/// completes, writes the result to `output` as pretty-printed JSON. Nothing is
/// written for dropped or failed messages.
pub async fn process_file(
    chain: &ProcessorChain,
    input: &Path,
    output: &Path,
) -> Result<ChainResult, OfflineError> {
    let payload = tokio::fs::read(input)
        .await
        .map_err(|source| OfflineError::Read {
            path: input.to_path_buf(),
            source,
        })?;

    let message = contracts::decode(&payload)?;
    info!(chain = %chain, input = %input.display(), "Processing file");

    let result = chain.run(message).await;

    if let ChainOutcome::Completed(message) = &result.outcome {
        let mut rendered = serde_json::to_vec_pretty(message)?;
        rendered.push(b'\n');
        tokio::fs::write(output, rendered)
            .await
            .map_err(|source| OfflineError::Write {
                path: output.to_path_buf(),
                source,
            })?;
        info!(output = %output.display(), "Result written");
    }

    Ok(result)
}

#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{StepOutput, step_fn};
    use crate::contracts::StepError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn chain() -> ProcessorChain {
        let mut chain = ProcessorChain::new("file");
        chain
            .add_step(
                "mark",
                step_fn(|mut message| {
                    message["processed"] = json!(true);
                    Ok(StepOutput::Forward(message))
                }),
            )
            .unwrap();
        chain
            .add_step(
                "reject_empty",
                step_fn(|message| {
                    if message.get("body").is_some() {
                        Ok(StepOutput::Forward(message))
                    } else {
                        Err(StepError::failed("body missing"))
                    }
                }),
            )
            .unwrap();
        chain
    }

    #[tokio::test]
    async fn test_writes_completed_result() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        std::fs::write(&input, r#"{"body": "hello"}"#).unwrap();

        let result = process_file(&chain(), &input, &output).await.unwrap();

        assert_eq!(result.outcome.variant(), "completed");
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(written, json!({"body": "hello", "processed": true}));
    }

    #[tokio::test]
    async fn test_failed_chain_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        std::fs::write(&input, r#"{"title": "no body"}"#).unwrap();

        let result = process_file(&chain(), &input, &output).await.unwrap();

        assert_eq!(result.outcome.step(), Some("reject_empty"));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_malformed_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        std::fs::write(&input, "not json").unwrap();

        let err = process_file(&chain(), &input, &dir.path().join("out.json"))
            .await
            .unwrap_err();

        assert!(matches!(err, OfflineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = process_file(&chain(), &dir.path().join("absent.json"), &dir.path().join("out.json"))
            .await
            .unwrap_err();

        assert!(matches!(err, OfflineError::Read { .. }));
    }
}
