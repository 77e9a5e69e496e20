//! Transport error types.

use thiserror::Error;

/// Errors raised by the broker transport.
///
/// Only [`QueueError::Topology`] is fatal to the worker; everything else is
/// either retried by the connector or observed and dropped by the handler.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("failed to declare topology: {0}")]
    Topology(String),

    #[error("failed to start consumer: {0}")]
    Consume(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to finalize delivery: {0}")]
    Ack(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("no active channel")]
    NotConnected,
}

impl QueueError {
    /// Whether the connector should give up instead of redialing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Topology(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_topology_is_fatal() {
        assert!(QueueError::Topology("exchange".into()).is_fatal());
        assert!(!QueueError::Connect("refused".into()).is_fatal());
        assert!(!QueueError::Channel("closed".into()).is_fatal());
        assert!(!QueueError::NotConnected.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::Publish("timeout".into());
        assert_eq!(err.to_string(), "failed to publish message: timeout");
    }
}
