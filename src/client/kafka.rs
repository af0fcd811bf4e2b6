//! `rdkafka` implementation of the consumer group client
//!
//! librdkafka drives group membership on its own threads and reports partition
//! assignment through rebalance callbacks. [`GroupContext`] forwards those
//! callbacks as [`GroupEvent`]s; [`KafkaConsumerGroup::consume`] feeds those
//! events and the message stream to a [`GenerationDriver`].
//!
//! Offsets are stored with `store_offsets` when a message is marked and
//! committed by librdkafka's auto-commit, with a synchronous commit before
//! partitions are revoked and when the client is closed.
//!
//! Revocation stops every claim of the generation and waits for the message
//! each claim is processing to be marked before committing. Messages still
//! buffered for a revoked partition are dropped unprocessed; the next owner
//! of the partition consumes them from the committed offset.

use crate::client::generation::{
    is_fatal, AssignedPartition, ClaimSlot, GenerationDriver, GroupEvent, Step,
};
use crate::client::{
    wait_for_shutdown, ClaimTracker, ConsumerGroupClient, ConsumerGroupHandler,
    ConsumerGroupSession, ConsumerMessage,
};
use crate::config::{BrokerConfiguration, ClientOptions};
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// Raw offset reported for partitions without a known position
const UNKNOWN_OFFSET: i64 = -1001;

/// Client context that forwards rebalance callbacks to the consume loop
pub struct GroupContext {
    events: mpsc::UnboundedSender<GroupEvent>,
    claims: ClaimSlot,
    revoke_timeout: Duration,
}

impl GroupContext {
    fn notify(&self, event: GroupEvent) {
        if self.events.send(event).is_err() {
            debug!("Consumer group dropped, ignoring group event");
        }
    }
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        if is_fatal(&error) {
            error!(error = %error, reason = %reason, "Fatal Kafka client error");
            self.notify(GroupEvent::ClientFailure(format!("{error}: {reason}")));
        } else {
            warn!(error = %error, reason = %reason, "Kafka client error");
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "Partitions revoked");
                let tracker = self.claims.lock().clone();
                if let Some(tracker) = tracker {
                    tracker.revoke();
                    if !wait_for_claims(&tracker, self.revoke_timeout) {
                        warn!(
                            in_flight = tracker.in_flight(),
                            "Revoking partitions with messages still being processed"
                        );
                    }
                }
                if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
                    log_commit_error(&e);
                }
                self.notify(GroupEvent::Revoked);
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "Rebalance failed");
                self.notify(GroupEvent::RebalanceFailed(e.to_string()));
            }
            Rebalance::Assign(_) => {}
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(partitions) = rebalance {
            let assigned: Vec<AssignedPartition> = partitions
                .elements()
                .iter()
                .map(|elem| AssignedPartition {
                    topic: elem.topic().to_string(),
                    partition: elem.partition(),
                    offset: elem.offset().to_raw().unwrap_or(UNKNOWN_OFFSET),
                })
                .collect();
            info!(partitions = assigned.len(), "Partitions assigned");
            self.notify(GroupEvent::Assigned(assigned));
        }
    }
}

type GroupStreamConsumer = StreamConsumer<GroupContext>;

/// Wait for the claims of a revoked generation to settle their messages
///
/// Claim tasks need other worker threads to make progress while the
/// rebalance callback blocks, so there is no waiting on a current-thread
/// runtime.
fn wait_for_claims(tracker: &ClaimTracker, timeout: Duration) -> bool {
    if tracker.in_flight() == 0 {
        return true;
    }
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| tracker.wait_idle(timeout))
        }
        Ok(_) => false,
        Err(_) => tracker.wait_idle(timeout),
    }
}

fn is_nothing_to_commit(error: &KafkaError) -> bool {
    matches!(error, KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset))
}

fn log_commit_error(error: &KafkaError) {
    if is_nothing_to_commit(error) {
        debug!("No stored offsets to commit");
    } else {
        warn!(error = %error, "Failed to commit offsets");
    }
}

impl From<&BorrowedMessage<'_>> for ConsumerMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        }
    }
}

/// Build the librdkafka configuration for a group member
pub fn client_config(broker: &BrokerConfiguration, options: &ClientOptions) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &broker.address)
        .set("group.id", &broker.group)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", &options.auto_offset_reset)
        .set(
            "session.timeout.ms",
            options.session_timeout.as_millis().to_string(),
        );

    if let Some(timeout) = broker.timeout {
        let millis = timeout.as_millis().to_string();
        config
            .set("socket.timeout.ms", &millis)
            .set("socket.connection.setup.timeout.ms", &millis);
    }

    if let Some(version) = &options.broker_version_fallback {
        config.set("broker.version.fallback", version);
    }

    for (key, value) in &options.properties {
        config.set(key, value);
    }

    config
}

struct KafkaSession {
    consumer: Arc<GroupStreamConsumer>,
    generation: u64,
}

impl ConsumerGroupSession for KafkaSession {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn mark_message(&self, message: &ConsumerMessage, _metadata: &str) {
        let mut offsets = TopicPartitionList::new();
        let stored = offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .and_then(|_| self.consumer.store_offsets(&offsets));

        if let Err(e) = stored {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Unable to mark message"
            );
        }
    }
}

/// Consumer group member backed by an `rdkafka` [`StreamConsumer`]
pub struct KafkaConsumerGroup {
    consumer: Arc<GroupStreamConsumer>,
    events: Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
    subscription: parking_lot::Mutex<Vec<String>>,
    claims: ClaimSlot,
    generation: AtomicU64,
    claim_buffer_size: usize,
    closed: AtomicBool,
}

impl KafkaConsumerGroup {
    /// Create the group member; no broker connection is required yet
    pub fn new(
        broker: &BrokerConfiguration,
        options: &ClientOptions,
    ) -> std::result::Result<Self, ClientError> {
        info!(addr = %broker.address, group = %broker.group, "Configuration");

        let (tx, rx) = mpsc::unbounded_channel();
        let claims = ClaimSlot::default();
        let context = GroupContext {
            events: tx,
            claims: claims.clone(),
            revoke_timeout: options.session_timeout,
        };
        let consumer: GroupStreamConsumer = client_config(broker, options)
            .create_with_context(context)
            .map_err(|e| ClientError::Create(e.to_string()))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            events: Mutex::new(rx),
            subscription: parking_lot::Mutex::new(Vec::new()),
            claims,
            generation: AtomicU64::new(0),
            claim_buffer_size: options.claim_buffer_size.max(1),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_subscribed(&self, topics: &[String]) -> std::result::Result<(), ClientError> {
        let mut subscription = self.subscription.lock();
        if subscription.as_slice() == topics {
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| ClientError::Subscribe(e.to_string()))?;

        info!(topics = ?topics, "Subscribed to topics");
        *subscription = topics.to_vec();
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroupClient for KafkaConsumerGroup {
    #[instrument(skip(self, handler, shutdown))]
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::result::Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        self.ensure_subscribed(topics)?;

        let mut events = self.events.lock().await;
        let mut stream = self.consumer.stream();
        let consumer = self.consumer.clone();
        let generation = &self.generation;
        let mut driver = GenerationDriver::new(
            handler,
            move || -> Arc<dyn ConsumerGroupSession> {
                Arc::new(KafkaSession {
                    consumer: consumer.clone(),
                    generation: generation.fetch_add(1, Ordering::SeqCst) + 1,
                })
            },
            self.claims.clone(),
            self.claim_buffer_size,
        );

        let outcome = loop {
            let step = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => Step::Shutdown,
                Some(event) = events.recv() => Step::Group(event),
                next = stream.next() => match next {
                    Some(Ok(message)) => Step::Message(ConsumerMessage::from(&message)),
                    Some(Err(e)) => Step::Failure(e),
                    None => Step::Shutdown,
                },
            };

            if let Some(outcome) = driver.apply(step).await {
                break outcome;
            }
        };

        if driver.finish().await {
            if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Async) {
                log_commit_error(&e);
            }
        }

        outcome
    }

    async fn close(&self) -> std::result::Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let consumer = self.consumer.clone();
        let committed = tokio::task::spawn_blocking(move || {
            consumer.commit_consumer_state(CommitMode::Sync)
        })
        .await
        .map_err(|e| ClientError::Close(e.to_string()))?;

        self.consumer.unsubscribe();
        info!("Consumer group closed");

        match committed {
            Ok(()) => Ok(()),
            Err(e) if is_nothing_to_commit(&e) => Ok(()),
            Err(e) => Err(ClientError::Close(e.to_string())),
        }
    }
}
