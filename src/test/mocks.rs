use crate::client::{
    wait_for_shutdown, ConsumerGroupClient, ConsumerGroupHandler, ConsumerGroupSession,
    ConsumerMessage, PartitionClaim,
};
use crate::error::{ClientError, ProcessingError};
use crate::processor::MessageProcessor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::debug;

/// How a scripted generation ends
#[derive(Debug, Clone)]
pub enum GenerationEnd {
    /// Claims drain, then the generation ends as if partitions were revoked
    Rebalance,
    /// Claims drain, then the generation lasts until shutdown
    Shutdown,
    /// Joining never completes; returns on shutdown without running setup
    Stall,
    /// Joining fails with the given error
    Fail(ClientError),
}

#[derive(Debug, Clone)]
pub struct MockClaim {
    pub topic: String,
    pub partition: i32,
    pub messages: Vec<ConsumerMessage>,
}

/// One scripted generation of group membership
#[derive(Debug, Clone)]
pub struct MockGeneration {
    claims: Vec<MockClaim>,
    end: GenerationEnd,
}

impl Default for MockGeneration {
    fn default() -> Self {
        Self::until_shutdown()
    }
}

impl MockGeneration {
    pub fn rebalance() -> Self {
        Self {
            claims: Vec::new(),
            end: GenerationEnd::Rebalance,
        }
    }

    pub fn until_shutdown() -> Self {
        Self {
            claims: Vec::new(),
            end: GenerationEnd::Shutdown,
        }
    }

    pub fn stalled() -> Self {
        Self {
            claims: Vec::new(),
            end: GenerationEnd::Stall,
        }
    }

    pub fn failing(error: ClientError) -> Self {
        Self {
            claims: Vec::new(),
            end: GenerationEnd::Fail(error),
        }
    }

    pub fn with_claim(
        mut self,
        topic: &str,
        partition: i32,
        messages: Vec<ConsumerMessage>,
    ) -> Self {
        self.claims.push(MockClaim {
            topic: topic.to_string(),
            partition,
            messages,
        });
        self
    }
}

/// Session that records every marked message
#[derive(Debug, Clone)]
pub struct MockSession {
    generation: u64,
    marked: Arc<Mutex<Vec<ConsumerMessage>>>,
}

impl MockSession {
    pub fn new(generation: u64) -> Self {
        Self::shared(generation, Arc::new(Mutex::new(Vec::new())))
    }

    fn shared(generation: u64, marked: Arc<Mutex<Vec<ConsumerMessage>>>) -> Self {
        Self { generation, marked }
    }

    pub fn marked_messages(&self) -> Vec<ConsumerMessage> {
        self.marked.lock().clone()
    }

    pub fn marked_offsets(&self) -> Vec<i64> {
        self.marked.lock().iter().map(|m| m.offset).collect()
    }
}

impl ConsumerGroupSession for MockSession {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn mark_message(&self, message: &ConsumerMessage, _metadata: &str) {
        self.marked.lock().push(message.clone());
    }
}

/// Mock consumer group client driven by scripted generations
///
/// Once the script is exhausted every `consume` call behaves like a
/// generation with no claims that lasts until shutdown.
#[derive(Debug, Clone, Default)]
pub struct MockConsumerGroup {
    generations: Arc<Mutex<VecDeque<MockGeneration>>>,
    marked: Arc<Mutex<Vec<ConsumerMessage>>>,
    subscribed: Arc<Mutex<Vec<String>>>,
    close_error: Arc<Mutex<Option<ClientError>>>,
    calls: Arc<Mutex<Vec<&'static str>>>,
    consume_calls: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
    generation_counter: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl MockConsumerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_generation(&self, generation: MockGeneration) {
        self.generations.lock().push_back(generation);
    }

    pub fn fail_close(&self, error: ClientError) {
        *self.close_error.lock() = Some(error);
    }

    pub fn consume_count(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    /// Group callbacks and client calls in the order they happened
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    pub fn marked_messages(&self) -> Vec<ConsumerMessage> {
        self.marked.lock().clone()
    }

    /// Offsets marked so far, sorted
    pub fn marked_offsets(&self) -> Vec<i64> {
        let mut offsets: Vec<i64> = self.marked.lock().iter().map(|m| m.offset).collect();
        offsets.sort_unstable();
        offsets
    }
}

#[async_trait]
impl ConsumerGroupClient for MockConsumerGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        *self.subscribed.lock() = topics.to_vec();

        let MockGeneration { claims, end } = self.generations.lock().pop_front().unwrap_or_default();

        let hold_until_shutdown = match end {
            GenerationEnd::Fail(e) => return Err(e),
            GenerationEnd::Stall => {
                wait_for_shutdown(&mut shutdown).await;
                return Ok(());
            }
            GenerationEnd::Rebalance => false,
            GenerationEnd::Shutdown => true,
        };

        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(MockSession::shared(generation, self.marked.clone()));

        handler
            .setup(session.as_ref())
            .await
            .map_err(|e| ClientError::Handler(e.to_string()))?;
        self.calls.lock().push("setup");

        let mut tasks = JoinSet::new();
        for claim in claims {
            let initial_offset = claim.messages.first().map(|m| m.offset).unwrap_or(0);
            let (tx, rx) = mpsc::channel(claim.messages.len().max(1));
            for message in claim.messages {
                let _ = tx.try_send(message);
            }
            drop(tx);

            let mut partition_claim =
                PartitionClaim::new(claim.topic, claim.partition, initial_offset, rx);
            let handler = handler.clone();
            let session = session.clone();
            tasks.spawn(async move {
                handler
                    .consume_claim(session.as_ref(), &mut partition_claim)
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                debug!(error = %e, "Mock claim failed");
            }
        }

        if hold_until_shutdown {
            wait_for_shutdown(&mut shutdown).await;
        }

        if let Err(e) = handler.cleanup(session.as_ref()).await {
            debug!(error = %e, "Mock cleanup failed");
        }
        self.calls.lock().push("cleanup");

        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push("close");
        self.closed.store(true, Ordering::SeqCst);
        match self.close_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Processor that records messages and fails on request
#[derive(Debug, Clone, Default)]
pub struct MockMessageProcessor {
    processed: Arc<Mutex<Vec<ConsumerMessage>>>,
    failing_offsets: Arc<Mutex<HashSet<i64>>>,
    fail_all: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockMessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every message with this offset
    pub fn fail_offset(&self, offset: i64) {
        self.failing_offsets.lock().insert(offset);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn processed_messages(&self) -> Vec<ConsumerMessage> {
        self.processed.lock().clone()
    }

    pub fn process_count(&self) -> usize {
        self.processed.lock().len()
    }
}

#[async_trait]
impl MessageProcessor for MockMessageProcessor {
    async fn process(&self, message: &ConsumerMessage) -> Result<(), ProcessingError> {
        self.processed.lock().push(message.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_all.load(Ordering::SeqCst)
            || self.failing_offsets.lock().contains(&message.offset)
        {
            return Err(ProcessingError::Other(anyhow::anyhow!(
                "Simulated failure at offset {}",
                message.offset
            )));
        }

        Ok(())
    }
}
