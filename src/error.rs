//! Error types for the consumer group monitor

use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for consumer operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Consumer group client error: {0}")]
    Client(#[from] ClientError),

    #[error("Unable to recreate Kafka session: {0}")]
    SessionFailed(#[source] ClientError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors reported by a consumer group client
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Failed to create consumer group: {0}")]
    Create(String),

    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Session handler failed: {0}")]
    Handler(String),

    #[error("Failed to close consumer group: {0}")]
    Close(String),

    #[error("Consumer group is closed")]
    Closed,
}

/// Error returned by a message processor for a single message
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessingError {
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        ProcessingError::InvalidPayload(reason.into())
    }
}

impl From<JoinError> for ConsumerError {
    fn from(err: JoinError) -> Self {
        ConsumerError::Other(err.into())
    }
}
