//! Command-line operations of the monitor
//!
//! Exactly one operation runs per invocation: print the version, print the
//! authors, log the configuration, or (by default) consume until Ctrl-C.

use crate::config::ConfigStruct;
use crate::consumer::GroupConsumer;
use crate::error::ConsumerError;
use crate::processor::PayloadLogger;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Command-line flags
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "kafka-monitor")]
#[command(about = "Joins a Kafka consumer group and reports on every consumed message")]
#[command(long_about = None)]
pub struct CliFlags {
    /// Show the version and exit
    #[arg(long)]
    pub show_version: bool,

    /// Show the authors and exit
    #[arg(long)]
    pub show_authors: bool,

    /// Log the effective configuration and exit
    #[arg(long)]
    pub show_configuration: bool,

    /// Path to the TOML configuration file
    #[arg(short, long, env = "KAFKA_MONITOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Broker address, overrides `broker.address`
    #[arg(long, env = "KAFKA_MONITOR_BROKER_ADDRESS")]
    pub broker_address: Option<String>,

    /// Topic to consume, overrides `broker.topic`
    #[arg(long, env = "KAFKA_MONITOR_TOPIC")]
    pub topic: Option<String>,

    /// Consumer group name, overrides `broker.group`
    #[arg(long, env = "KAFKA_MONITOR_GROUP")]
    pub group: Option<String>,

    /// Log message content too
    #[arg(short, long)]
    pub verbose: bool,
}

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Ok = 0,
    ConfigurationError = 1,
    ConsumerError = 2,
    KafkaError = 3,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&ConsumerError> for ExitStatus {
    fn from(err: &ConsumerError) -> Self {
        match err {
            ConsumerError::ConfigError(_) => ExitStatus::ConfigurationError,
            ConsumerError::SessionFailed(_) => ExitStatus::KafkaError,
            _ => ExitStatus::ConsumerError,
        }
    }
}

/// Apply command-line overrides on top of file configuration
pub fn apply_overrides(configuration: &mut ConfigStruct, flags: &CliFlags) {
    if let Some(address) = &flags.broker_address {
        configuration.broker.address = address.clone();
    }
    if let Some(topic) = &flags.topic {
        configuration.broker.topic = topic.clone();
    }
    if let Some(group) = &flags.group {
        configuration.broker.group = group.clone();
    }
    if flags.verbose {
        configuration.output.verbose = true;
    }
}

pub fn show_version(out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "Kafka monitor version {}", env!("CARGO_PKG_VERSION"))
}

pub fn show_authors(out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "{}", env!("CARGO_PKG_AUTHORS").replace(':', ", "))
}

pub fn show_configuration(configuration: &ConfigStruct) {
    let broker = &configuration.broker;
    info!(
        address = %broker.address,
        topic = %broker.topic,
        group = %broker.group,
        timeout = ?broker.timeout,
        "Broker configuration"
    );
    info!(verbose = configuration.output.verbose, "Output configuration");
    info!(
        auto_offset_reset = %configuration.client.auto_offset_reset,
        session_timeout = ?configuration.client.session_timeout,
        claim_buffer_size = configuration.client.claim_buffer_size,
        "Client configuration"
    );
}

/// Run the operation selected by `flags`
pub async fn do_selected_operation(
    configuration: &ConfigStruct,
    flags: &CliFlags,
    out: &mut impl Write,
) -> ExitStatus {
    let printed = if flags.show_version {
        show_version(out)
    } else if flags.show_authors {
        show_authors(out)
    } else if flags.show_configuration {
        show_configuration(configuration);
        Ok(())
    } else {
        return match start_consumer(configuration).await {
            Ok(()) => ExitStatus::Ok,
            Err(e) => {
                error!(error = %e, "Consumer failed");
                ExitStatus::from(&e)
            }
        };
    };

    match printed {
        Ok(()) => ExitStatus::Ok,
        Err(e) => {
            error!(error = %e, "Unable to write to standard output");
            ExitStatus::ConsumerError
        }
    }
}

/// Consume until Ctrl-C or a fatal session failure
pub async fn start_consumer(configuration: &ConfigStruct) -> crate::Result<()> {
    configuration.broker.validate()?;

    let consumer = Arc::new(GroupConsumer::with_options(
        configuration.broker.clone(),
        &configuration.client,
        PayloadLogger::new(configuration.output.verbose),
    )?);

    let mut serving = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.serve().await }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Unable to listen for the interrupt signal");
            }
            info!("Interrupted, closing consumer");
            consumer.close().await?;
            serving.await??;
        }
        finished = &mut serving => {
            consumer.close().await?;
            finished??;
        }
    }

    let counters = consumer.counters();
    info!(
        consumed_messages = counters.consumed,
        errors = counters.errors,
        "Consumer stopped"
    );
    Ok(())
}
