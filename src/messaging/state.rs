use serde::Serialize;
use std::fmt;

/// Lifecycle of the transport's logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Consuming,
    Reconnecting,
}

impl TransportState {
    pub fn can_publish(self) -> bool {
        matches!(self, Self::Connected | Self::Consuming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Consuming => "consuming",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Numeric encoding for the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Consuming => 3.0,
            Self::Reconnecting => 4.0,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_allowed_only_while_linked() {
        assert!(TransportState::Connected.can_publish());
        assert!(TransportState::Consuming.can_publish());
        assert!(!TransportState::Reconnecting.can_publish());
        assert!(!TransportState::Connecting.can_publish());
        assert!(!TransportState::Disconnected.can_publish());
    }
}
