//! Generation state machine of the Kafka client
//!
//! [`GenerationDriver`] is fed one [`Step`] at a time by the consume loop and
//! knows nothing about librdkafka: it starts a generation on the first
//! assignment or message, runs one claim task per partition and ends the
//! generation on revocation, shutdown or a fatal failure.

use crate::client::{
    ClaimTracker, ConsumerGroupHandler, ConsumerGroupSession, ConsumerMessage, PartitionClaim,
};
use crate::error::{ClientError, Result};
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Claim tracker of the active generation, shared with the rebalance callback
pub type ClaimSlot = Arc<Mutex<Option<Arc<ClaimTracker>>>>;

/// A partition handed to this member by a rebalance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Group membership events raised from librdkafka callbacks
#[derive(Debug, Clone)]
pub enum GroupEvent {
    Assigned(Vec<AssignedPartition>),
    Revoked,
    RebalanceFailed(String),
    ClientFailure(String),
}

/// One input of the consume loop
#[derive(Debug)]
pub enum Step {
    Shutdown,
    Group(GroupEvent),
    Message(ConsumerMessage),
    Failure(KafkaError),
}

/// Errors after which the client cannot make progress on its own
pub fn is_fatal(error: &KafkaError) -> bool {
    use rdkafka::types::RDKafkaErrorCode;

    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::Authentication
        )
    )
}

/// Claims and claim tasks of the generation currently being consumed
struct ActiveGeneration {
    session: Arc<dyn ConsumerGroupSession>,
    handler: Arc<dyn ConsumerGroupHandler>,
    tracker: Arc<ClaimTracker>,
    claims: HashMap<(String, i32), mpsc::Sender<ConsumerMessage>>,
    tasks: JoinSet<Result<()>>,
    buffer_size: usize,
}

impl ActiveGeneration {
    fn open_claim(&mut self, topic: String, partition: i32, initial_offset: i64) {
        let key = (topic, partition);
        if self.claims.contains_key(&key) {
            return;
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let mut claim = PartitionClaim::new(key.0.clone(), partition, initial_offset, rx)
            .with_tracker(self.tracker.clone());
        let session = self.session.clone();
        let handler = self.handler.clone();

        self.tasks
            .spawn(async move { handler.consume_claim(session.as_ref(), &mut claim).await });
        self.claims.insert(key, tx);
    }

    async fn dispatch(&mut self, message: ConsumerMessage) {
        if self.tracker.is_revoked() {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Dropping message of a revoked generation"
            );
            return;
        }

        let key = (message.topic.clone(), message.partition);
        if !self.claims.contains_key(&key) {
            self.open_claim(key.0.clone(), key.1, message.offset);
        }

        if let Some(sender) = self.claims.get(&key) {
            if let Err(e) = sender.send(message).await {
                warn!(
                    topic = %key.0,
                    partition = key.1,
                    offset = e.0.offset,
                    "Partition claim ended before message was delivered"
                );
            }
        }
    }

    /// Close every claim, wait for the claim tasks and run cleanup
    async fn finish(mut self) {
        self.claims.clear();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Partition claim failed"),
                Err(e) => error!(error = %e, "Partition claim task panicked"),
            }
        }

        if let Err(e) = self.handler.cleanup(self.session.as_ref()).await {
            warn!(
                generation = self.session.generation(),
                error = %e,
                "Session cleanup failed"
            );
        }
    }
}

/// Drives a handler through at most one generation
pub struct GenerationDriver<F> {
    handler: Arc<dyn ConsumerGroupHandler>,
    new_session: F,
    slot: ClaimSlot,
    buffer_size: usize,
    active: Option<ActiveGeneration>,
}

impl<F> GenerationDriver<F>
where
    F: FnMut() -> Arc<dyn ConsumerGroupSession> + Send,
{
    pub fn new(
        handler: Arc<dyn ConsumerGroupHandler>,
        new_session: F,
        slot: ClaimSlot,
        buffer_size: usize,
    ) -> Self {
        Self {
            handler,
            new_session,
            slot,
            buffer_size: buffer_size.max(1),
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Number of partitions claimed in the active generation
    pub fn claim_count(&self) -> usize {
        self.active.as_ref().map_or(0, |active| active.claims.len())
    }

    async fn ensure_started(&mut self) -> std::result::Result<(), ClientError> {
        if self.active.is_some() {
            return Ok(());
        }

        let session = (self.new_session)();
        self.handler
            .setup(session.as_ref())
            .await
            .map_err(|e| ClientError::Handler(e.to_string()))?;

        let tracker = Arc::new(ClaimTracker::new());
        *self.slot.lock() = Some(tracker.clone());
        self.active = Some(ActiveGeneration {
            session,
            handler: self.handler.clone(),
            tracker,
            claims: HashMap::new(),
            tasks: JoinSet::new(),
            buffer_size: self.buffer_size,
        });
        Ok(())
    }

    /// Apply one step, returning the outcome once the consume loop must stop
    pub async fn apply(&mut self, step: Step) -> Option<std::result::Result<(), ClientError>> {
        match step {
            Step::Shutdown => Some(Ok(())),
            Step::Group(GroupEvent::Assigned(partitions)) => {
                if let Err(e) = self.ensure_started().await {
                    return Some(Err(e));
                }
                if let Some(active) = self.active.as_mut() {
                    for assigned in partitions {
                        active.open_claim(assigned.topic, assigned.partition, assigned.offset);
                    }
                }
                None
            }
            Step::Group(GroupEvent::Revoked) => {
                if self.active.is_some() {
                    Some(Ok(()))
                } else {
                    debug!("Revocation before any generation started, ignoring");
                    None
                }
            }
            Step::Group(GroupEvent::RebalanceFailed(reason)) => {
                warn!(reason = %reason, "Rebalance failed, waiting for the next assignment");
                None
            }
            Step::Group(GroupEvent::ClientFailure(reason)) => {
                Some(Err(ClientError::Transport(reason)))
            }
            Step::Message(message) => {
                if let Err(e) = self.ensure_started().await {
                    return Some(Err(e));
                }
                if let Some(active) = self.active.as_mut() {
                    active.dispatch(message).await;
                }
                None
            }
            Step::Failure(e) if is_fatal(&e) => Some(Err(ClientError::Transport(e.to_string()))),
            Step::Failure(e) => {
                warn!(error = %e, "Error while consuming, continuing");
                None
            }
        }
    }

    /// End the active generation; returns whether one was running
    pub async fn finish(self) -> bool {
        let Some(active) = self.active else {
            return false;
        };
        active.finish().await;
        self.slot.lock().take();
        true
    }
}
