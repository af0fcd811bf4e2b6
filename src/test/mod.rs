//! Test utilities and mock implementations for testing the consumer

pub mod mocks;

use crate::client::ConsumerMessage;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    pub const TOPIC: &'static str = "ccx";

    /// Create a message on partition 0 of the test topic
    pub fn create_test_message(offset: i64, payload: &str) -> ConsumerMessage {
        Self::create_partition_message(0, offset, payload)
    }

    pub fn create_partition_message(partition: i32, offset: i64, payload: &str) -> ConsumerMessage {
        ConsumerMessage::new(Self::TOPIC, partition, offset, payload.to_string())
            .with_timestamp(Utc::now())
    }

    /// Create `count` messages with offsets `0..count`
    pub fn create_test_messages(count: usize) -> Vec<ConsumerMessage> {
        (0..count)
            .map(|i| Self::create_test_message(i as i64, &format!("data-{}", i)))
            .collect()
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_for_condition<F>(mut check: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// A log event recorded by [`LogCapture`]
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Tracing layer that keeps every event for later assertions
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the capture as the subscriber of the current thread
    pub fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::set_default(subscriber)
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    pub fn events_with_message(&self, message: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.message == message)
            .cloned()
            .collect()
    }

    pub fn events_with_message_prefix(&self, prefix: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.message.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl EventVisitor {
    fn record_value(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, format!("{:?}", value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{info, warn};

    #[test]
    fn test_create_test_messages() {
        let messages = TestUtils::create_test_messages(3);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].offset, 0);
        assert_eq!(messages[2].payload.as_ref(), b"data-2");
        assert!(messages.iter().all(|m| m.topic == "ccx" && m.partition == 0));
    }

    #[test]
    fn test_log_capture_records_fields() {
        let capture = LogCapture::new();
        let _guard = capture.set_default();

        info!(length = 3, name = "abc", "Message length");
        warn!("Something odd");

        let events = capture.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, Level::INFO);
        assert_eq!(events[0].message, "Message length");
        assert_eq!(events[0].field("length"), Some("3"));
        assert_eq!(events[0].field("name"), Some("abc"));
        assert_eq!(events[1].level, Level::WARN);
    }

    #[tokio::test]
    async fn test_wait_for_condition_times_out() {
        let result = wait_for_condition(|| false, Duration::from_millis(30)).await;
        assert!(result.is_err());
    }
}
