//! Message processing hook
//!
//! The consumer measures, counts and logs every message; what happens to the
//! payload itself is decided by a [`MessageProcessor`].

use crate::client::ConsumerMessage;
use crate::error::ProcessingError;
use async_trait::async_trait;
use tracing::info;

/// Trait for implementing message processing logic
///
/// Returning an error marks the message as failed in the consumer counters.
/// Failed messages are still marked as consumed; they are never retried.
///
/// # Examples
///
/// ```rust
/// use kafka_monitor::processor::MessageProcessor;
/// use kafka_monitor::client::ConsumerMessage;
/// use kafka_monitor::error::ProcessingError;
///
/// struct RejectEmpty;
///
/// #[async_trait::async_trait]
/// impl MessageProcessor for RejectEmpty {
///     async fn process(&self, message: &ConsumerMessage) -> Result<(), ProcessingError> {
///         if message.payload.is_empty() {
///             return Err(ProcessingError::invalid_payload("empty payload"));
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process a single message consumed from the topic
    async fn process(&self, message: &ConsumerMessage) -> Result<(), ProcessingError>;
}

/// Default processor: logs payload length, and payload content when verbose
#[derive(Debug, Clone, Default)]
pub struct PayloadLogger {
    verbose: bool,
}

impl PayloadLogger {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

#[async_trait]
impl MessageProcessor for PayloadLogger {
    async fn process(&self, message: &ConsumerMessage) -> Result<(), ProcessingError> {
        let value = &message.payload;

        info!(length = value.len(), "Message length");

        if self.verbose {
            info!(content = %String::from_utf8_lossy(value), "Message value");
        }

        Ok(())
    }
}
