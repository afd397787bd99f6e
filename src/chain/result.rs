use serde::{Serialize, Serializer};
use std::time::Duration;

use crate::contracts::{ErrorHandlerError, Message, StepError};

/// Wall-clock time spent in one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepTiming {
    pub step: String,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_micros() as f64 / 1000.0)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Completed(Message),
    Dropped {
        step: String,
    },
    Failed {
        step: String,
        cause: StepError,
        /// Set when the error handler itself failed.
        handler_error: Option<ErrorHandlerError>,
    },
}

impl ChainOutcome {
    pub fn variant(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Dropped { .. } => "dropped",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Completed(_) => None,
            Self::Dropped { step } | Self::Failed { step, .. } => Some(step),
        }
    }

    /// A failure whose error handler also failed.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::Failed {
                handler_error: Some(_),
                ..
            }
        )
    }
}

/// Result of running one message through a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainResult {
    pub outcome: ChainOutcome,
    pub timings: Vec<StepTiming>,
}

impl ChainResult {
    pub fn total_duration(&self) -> Duration {
        self.timings.iter().map(|t| t.duration).sum()
    }
}

/// A chain execution that was abandoned because shutdown cancelled it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Chain execution aborted during step '{step}'")]
pub struct ChainAborted {
    pub step: String,
    pub timings: Vec<StepTiming>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_accessors() {
        let failed = ChainOutcome::Failed {
            step: "enrich".into(),
            cause: StepError::failed("x"),
            handler_error: Some(ErrorHandlerError::new("y")),
        };
        assert_eq!(failed.variant(), "failed");
        assert_eq!(failed.step(), Some("enrich"));
        assert!(failed.is_unrecoverable());

        let completed = ChainOutcome::Completed(json!({}));
        assert_eq!(completed.step(), None);
        assert!(!completed.is_unrecoverable());
    }

    #[test]
    fn test_timing_serializes_as_millis() {
        let timing = StepTiming {
            step: "a".into(),
            duration: Duration::from_millis(12),
        };
        let json = serde_json::to_value(&timing).unwrap();
        assert_eq!(json["step"], "a");
        assert_eq!(json["duration_ms"], 12.0);
    }
}
