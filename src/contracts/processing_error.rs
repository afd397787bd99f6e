use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a processing step did not produce an output.
///
/// Every variant is terminal for the message being processed:
/// - `Failed`: the step reported an error.
/// - `Timeout`: the step exceeded its time limit and was cancelled.
/// - `Panicked`: the step panicked; the panic was contained at the chain boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    Failed { reason: String },
    Timeout { limit_ms: u64 },
    Panicked { reason: String },
}

impl StepError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::Timeout {
            limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn panicked(reason: impl Into<String>) -> Self {
        Self::Panicked {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Failed { reason } | Self::Panicked { reason } => reason.clone(),
            Self::Timeout { limit_ms } => format!("exceeded {limit_ms}ms"),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "failed",
            Self::Timeout { .. } => "timeout",
            Self::Panicked { .. } => "panicked",
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "Step failed: {}", reason),
            Self::Timeout { limit_ms } => write!(f, "Step timed out after {}ms", limit_ms),
            Self::Panicked { reason } => write!(f, "Step panicked: {}", reason),
        }
    }
}

impl std::error::Error for StepError {}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::failed(err.to_string())
    }
}

/// Raised by an error handler. Makes the failed execution unrecoverable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("Error handler failed: {reason}")]
pub struct ErrorHandlerError {
    pub reason: String,
}

impl ErrorHandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_error() {
        let err = StepError::failed("lookup refused");
        assert!(!err.is_timeout());
        assert_eq!(err.reason(), "lookup refused");
        assert_eq!(err.error_type(), "failed");
        assert_eq!(err.to_string(), "Step failed: lookup refused");
    }

    #[test]
    fn test_timeout_error() {
        let err = StepError::timeout(Duration::from_millis(250));
        assert!(err.is_timeout());
        assert_eq!(err.error_type(), "timeout");
        assert_eq!(err.to_string(), "Step timed out after 250ms");
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_value(StepError::panicked("boom")).unwrap();
        assert_eq!(json["kind"], "panicked");
        assert_eq!(json["reason"], "boom");
    }
}
