//! Consumer group client abstraction
//!
//! A [`ConsumerGroupClient`] joins a group, and for every generation of group
//! membership drives a [`ConsumerGroupHandler`]: `setup` once, then
//! `consume_claim` for every assigned partition (concurrently across
//! partitions), then `cleanup` once. `consume` returns when the generation ends,
//! either because of a rebalance or because shutdown was requested.

pub mod generation;
pub mod kafka;

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub use kafka::KafkaConsumerGroup;

/// A message delivered to a partition claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

impl ConsumerMessage {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp: None,
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// One generation of group membership
pub trait ConsumerGroupSession: Send + Sync {
    /// Sequence number of this generation, starting at 1
    fn generation(&self) -> u64;

    /// Mark a message as processed so its offset is committed
    fn mark_message(&self, message: &ConsumerMessage, metadata: &str);
}

#[derive(Debug, Default)]
struct TrackerState {
    revoked: bool,
    in_flight: usize,
}

/// Messages handed out by the claims of one generation
///
/// A message is in flight from the moment a claim returns it until the claim
/// is asked for the next one, which happens after the message was marked.
/// Once revoked, claims hand out nothing more and end.
#[derive(Debug)]
pub struct ClaimTracker {
    state: Mutex<TrackerState>,
    idle: Condvar,
    revoked: watch::Sender<bool>,
}

impl Default for ClaimTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            idle: Condvar::new(),
            revoked: watch::channel(false).0,
        }
    }

    /// Stop every claim of the generation; buffered messages are dropped
    pub fn revoke(&self) {
        self.state.lock().revoked = true;
        self.revoked.send_replace(true);
    }

    pub fn is_revoked(&self) -> bool {
        self.state.lock().revoked
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Block the calling thread until no message is in flight
    ///
    /// Returns `false` if messages were still in flight after `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        self.idle.wait_while_for(&mut state, |s| s.in_flight > 0, timeout);
        state.in_flight == 0
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.revoked {
            return false;
        }
        state.in_flight += 1;
        true
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

/// The message sequence of a single partition for one generation
///
/// The sequence ends when the partition is revoked or the session ends.
#[derive(Debug)]
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    initial_offset: i64,
    messages: mpsc::Receiver<ConsumerMessage>,
    tracker: Option<Arc<ClaimTracker>>,
    revoked: Option<watch::Receiver<bool>>,
    holding: bool,
}

impl PartitionClaim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        messages: mpsc::Receiver<ConsumerMessage>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            messages,
            tracker: None,
            revoked: None,
            holding: false,
        }
    }

    /// Report handed out messages to `tracker` and stop once it is revoked
    pub fn with_tracker(mut self, tracker: Arc<ClaimTracker>) -> Self {
        self.revoked = Some(tracker.revoked.subscribe());
        self.tracker = Some(tracker);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset the claim started from
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// Wait for the next message, `None` once the claim is over
    ///
    /// Asking for the next message settles the previous one.
    pub async fn next_message(&mut self) -> Option<ConsumerMessage> {
        self.release();

        let message = match self.revoked.as_mut() {
            Some(revoked) => tokio::select! {
                biased;
                _ = wait_for_shutdown(revoked) => None,
                message = self.messages.recv() => message,
            },
            None => self.messages.recv().await,
        }?;

        if let Some(tracker) = &self.tracker {
            if !tracker.try_acquire() {
                return None;
            }
            self.holding = true;
        }
        Some(message)
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.holding) {
            if let Some(tracker) = &self.tracker {
                tracker.release();
            }
        }
    }
}

impl Drop for PartitionClaim {
    fn drop(&mut self) {
        self.release();
    }
}

/// Callbacks invoked by a [`ConsumerGroupClient`] during a generation
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    /// Runs once per generation, before any claim is consumed
    async fn setup(&self, session: &dyn ConsumerGroupSession) -> Result<()>;

    /// Runs once per generation, after every claim has finished
    async fn cleanup(&self, session: &dyn ConsumerGroupSession) -> Result<()>;

    /// Consumes one partition claim until its message sequence ends
    async fn consume_claim(
        &self,
        session: &dyn ConsumerGroupSession,
        claim: &mut PartitionClaim,
    ) -> Result<()>;
}

/// Group membership primitive
#[async_trait]
pub trait ConsumerGroupClient: Send + Sync + 'static {
    /// Join the group for `topics` and run one generation through `handler`
    ///
    /// Returns `Ok(())` when the generation ends because of a rebalance or
    /// because `shutdown` turned `true`. Errors are transport or session
    /// failures that the client could not recover from.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> std::result::Result<(), ClientError>;

    /// Leave the group and release client resources
    async fn close(&self) -> std::result::Result<(), ClientError>;
}

/// Resolves once the flag turns `true` or its sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
