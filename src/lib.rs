//! Kafka Monitor - a consumer group member that reports on every message
//!
//! This crate joins a Kafka consumer group, consumes one topic and logs the
//! length (and optionally the content) of every message, together with
//! running counts of processed and failed messages. It keeps rejoining the
//! group after every rebalance until it is closed.

pub mod cli;
pub mod client;
pub mod config;
pub mod consumer;
pub mod counters;
pub mod error;
pub mod processor;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use config::{BrokerConfiguration, ClientOptions, ConfigStruct, OutputConfiguration};
pub use consumer::GroupConsumer;
pub use counters::CounterSnapshot;
pub use error::{ClientError, ConsumerError, ProcessingError, Result};
pub use processor::{MessageProcessor, PayloadLogger};

// Re-export the group client seam
pub use client::{
    ClaimTracker, ConsumerGroupClient, ConsumerGroupHandler, ConsumerGroupSession,
    ConsumerMessage, KafkaConsumerGroup, PartitionClaim,
};
