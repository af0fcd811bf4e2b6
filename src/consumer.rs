//! Consumer group lifecycle
//!
//! [`GroupConsumer`] joins a consumer group and keeps rejoining it after every
//! rebalance until it is closed. It handles:
//!
//! - Session driving: one background task re-entering the group client's
//!   consume primitive for every generation
//! - Claim processing: per-partition message loops, run concurrently across
//!   partitions by the client
//! - Counting and logging of every processed message
//! - Ready signaling and cancellation

use crate::client::{
    ConsumerGroupClient, ConsumerGroupHandler, ConsumerGroupSession, ConsumerMessage,
    KafkaConsumerGroup, PartitionClaim,
};
use crate::config::{BrokerConfiguration, ClientOptions};
use crate::counters::{CounterSnapshot, MessageCounters};
use crate::error::{ConsumerError, Result};
use crate::processor::{MessageProcessor, PayloadLogger};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Lifecycle {
    cancel: Option<watch::Sender<bool>>,
    /// Closed once the session driver has returned
    stopped: Option<watch::Receiver<()>>,
    closed: bool,
}

/// Consumer group member that processes, counts and logs every message
///
/// # Examples
///
/// ```rust,no_run
/// use kafka_monitor::{BrokerConfiguration, GroupConsumer};
/// use std::sync::Arc;
///
/// async fn run() -> kafka_monitor::Result<()> {
///     let config = BrokerConfiguration::new("localhost:9092", "ccx", "monitor");
///     let consumer = Arc::new(GroupConsumer::new(config, false)?);
///
///     let serving = tokio::spawn({
///         let consumer = consumer.clone();
///         async move { consumer.serve().await }
///     });
///
///     tokio::signal::ctrl_c().await.ok();
///     consumer.close().await?;
///     serving.await??;
///     Ok(())
/// }
/// ```
pub struct GroupConsumer<P = PayloadLogger, G = KafkaConsumerGroup> {
    configuration: BrokerConfiguration,
    group: G,
    processor: P,
    counters: MessageCounters,
    /// Ready signal of the current generation, `None` once fired
    ready: Mutex<Option<oneshot::Sender<()>>>,
    lifecycle: Mutex<Lifecycle>,
    generations: AtomicU64,
    ready_signals: AtomicU64,
}

impl GroupConsumer<PayloadLogger, KafkaConsumerGroup> {
    /// Creates a Kafka-backed consumer that logs payload length (and content when verbose)
    pub fn new(configuration: BrokerConfiguration, verbose: bool) -> Result<Self> {
        Self::with_options(
            configuration,
            &ClientOptions::default(),
            PayloadLogger::new(verbose),
        )
    }
}

impl<P> GroupConsumer<P, KafkaConsumerGroup>
where
    P: MessageProcessor + 'static,
{
    /// Creates a Kafka-backed consumer with explicit client options
    pub fn with_options(
        configuration: BrokerConfiguration,
        options: &ClientOptions,
        processor: P,
    ) -> Result<Self> {
        configuration.validate()?;
        let group = KafkaConsumerGroup::new(&configuration, options)?;
        Ok(Self::with_client(configuration, group, processor))
    }
}

impl<P, G> GroupConsumer<P, G>
where
    P: MessageProcessor + 'static,
    G: ConsumerGroupClient,
{
    /// Creates a consumer on top of an existing group client
    pub fn with_client(configuration: BrokerConfiguration, group: G, processor: P) -> Self {
        Self {
            configuration,
            group,
            processor,
            counters: MessageCounters::new(),
            ready: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
            generations: AtomicU64::new(0),
            ready_signals: AtomicU64::new(0),
        }
    }

    /// Joins the group and consumes until [`close`](Self::close) is called
    ///
    /// Waits for the first generation to be set up, then for the session
    /// driver to stop. Returns an error when the group client fails with
    /// something other than a rebalance.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let (cancel_rx, stopped_tx) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                info!("Consumer already closed, not serving");
                return Ok(());
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (stopped_tx, stopped_rx) = watch::channel(());
            lifecycle.cancel = Some(cancel_tx);
            lifecycle.stopped = Some(stopped_rx);
            (cancel_rx, stopped_tx)
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        *self.ready.lock() = Some(ready_tx);

        let consumer = self.clone();
        let mut driver = tokio::spawn(async move {
            let _stopped = stopped_tx;
            consumer.drive_sessions(cancel_rx).await
        });

        info!("Waiting for consumer to become ready");
        tokio::select! {
            _ = ready_rx => {
                info!("Finished waiting for consumer to become ready");
            }
            finished = &mut driver => {
                info!("Session driver stopped before the consumer became ready");
                return finished?;
            }
        }

        info!("Started serving consumer");
        let finished = driver.await?;
        info!("Context cancelled, exiting");
        finished
    }

    async fn drive_sessions(self: Arc<Self>, cancel: watch::Receiver<bool>) -> Result<()> {
        let topics = vec![self.configuration.topic.clone()];

        loop {
            // The client returns whenever a generation ends; a rebalance
            // needs a fresh session to pick up the new claims.
            let handler: Arc<dyn ConsumerGroupHandler> = self.clone();
            let consumed = self.group.consume(&topics, handler, cancel.clone()).await;

            if *cancel.borrow() {
                if let Err(e) = consumed {
                    debug!(error = %e, "Session ended with an error during shutdown");
                }
                info!("Stopping consumer");
                return Ok(());
            }

            if let Err(e) = consumed {
                error!(error = %e, "Unable to recreate Kafka session");
                return Err(ConsumerError::SessionFailed(e));
            }

            info!("Created new kafka session");
            self.rearm_ready();
        }
    }

    /// Installs a fresh ready signal unless the current one has not fired yet
    fn rearm_ready(&self) {
        let mut ready = self.ready.lock();
        if ready.is_none() {
            let (ready_tx, _) = oneshot::channel();
            *ready = Some(ready_tx);
        }
    }

    fn fire_ready(&self) {
        match self.ready.lock().take() {
            Some(ready_tx) => {
                // Only the first generation has a waiter.
                let _ = ready_tx.send(());
                self.ready_signals.fetch_add(1, Ordering::SeqCst);
            }
            None => warn!("Ready signal already fired for this generation"),
        }
    }

    /// Cancels the session driver and closes the group client
    ///
    /// The client is closed only after the driver has returned, so the
    /// current generation has finished and marked its messages. Safe to call
    /// before [`serve`](Self::serve) and more than once. Close errors from
    /// the client are logged, not returned.
    pub async fn close(&self) -> Result<()> {
        let stopped = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.closed = true;
            if let Some(cancel) = lifecycle.cancel.as_ref() {
                cancel.send_replace(true);
            }
            lifecycle.stopped.clone()
        };

        if let Some(mut stopped) = stopped {
            debug!("Waiting for the session driver to stop");
            // Resolves once the driver drops its sender.
            while stopped.changed().await.is_ok() {}
        }

        if let Err(e) = self.group.close().await {
            error!(error = %e, "Unable to close consumer group");
        }

        Ok(())
    }

    /// Number of messages processed without error since construction
    pub fn get_number_of_successfully_consumed_messages(&self) -> u64 {
        self.counters.snapshot().consumed
    }

    /// Number of messages whose processing failed since construction
    pub fn get_number_of_errors_consuming_messages(&self) -> u64 {
        self.counters.snapshot().errors
    }

    /// Both counters read together
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Number of generations set up so far
    pub fn generations(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    /// Number of ready signals fired so far, one per generation
    pub fn ready_signals_fired(&self) -> u64 {
        self.ready_signals.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> &BrokerConfiguration {
        &self.configuration
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn client(&self) -> &G {
        &self.group
    }

    /// Processes one message, updating counters and logging the outcome
    ///
    /// A missing message is logged and not counted.
    pub async fn handle_message(&self, message: Option<&ConsumerMessage>) {
        let Some(message) = message else {
            error!("nil message");
            return;
        };

        info!(
            offset = message.offset,
            partition = message.partition,
            topic = %message.topic,
            message_timestamp = ?message.timestamp,
            "Started processing message"
        );

        let start = Instant::now();
        let result = self.processor.process(message).await;
        let duration = start.elapsed().as_secs_f64();

        let counters = match result {
            Err(e) => {
                error!(
                    offset = message.offset,
                    partition = message.partition,
                    error = %e,
                    "Error processing message consumed from Kafka"
                );
                self.counters.record_error()
            }
            Ok(()) => self.counters.record_success(),
        };

        info!(
            topic = %self.configuration.topic,
            group = %self.configuration.group,
            offset = message.offset,
            partition = message.partition,
            consumed_messages = counters.consumed,
            errors = counters.errors,
            duration,
            "Processing of message took '{}' seconds",
            duration
        );
    }
}

#[async_trait]
impl<P, G> ConsumerGroupHandler for GroupConsumer<P, G>
where
    P: MessageProcessor + 'static,
    G: ConsumerGroupClient,
{
    async fn setup(&self, session: &dyn ConsumerGroupSession) -> Result<()> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        info!(generation = session.generation(), "New session has been setup");
        self.fire_ready();
        Ok(())
    }

    async fn cleanup(&self, session: &dyn ConsumerGroupSession) -> Result<()> {
        info!(generation = session.generation(), "Session has been finished");
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn ConsumerGroupSession,
        claim: &mut PartitionClaim,
    ) -> Result<()> {
        info!(
            topic = %claim.topic(),
            partition = claim.partition(),
            offset = claim.initial_offset(),
            "Starting messages loop"
        );

        while let Some(message) = claim.next_message().await {
            self.handle_message(Some(&message)).await;
            session.mark_message(&message, "");
        }

        debug!(
            topic = %claim.topic(),
            partition = claim.partition(),
            "Messages loop finished"
        );
        Ok(())
    }
}
