//! Configuration for the consumer group monitor
//!
//! Configuration is loaded from a TOML file with three sections:
//!
//! ```toml
//! [broker]
//! address = "localhost:9092"
//! topic = "ccx.ocp.results"
//! group = "kafka-monitor"
//! timeout = "30s"
//!
//! [output]
//! verbose = false
//!
//! [client]
//! auto_offset_reset = "latest"
//! ```
//!
//! Every value is threaded explicitly through constructors; there is no
//! process-wide default configuration.

use crate::error::{ConsumerError, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Connection details for the Kafka broker and the consumer group
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfiguration {
    /// Broker address, `host:port`
    pub address: String,
    /// Topic to consume from
    pub topic: String,
    /// Consumer group name
    pub group: String,
    /// Optional timeout applied to network operations
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub timeout: Option<Duration>,
}

impl BrokerConfiguration {
    pub fn new(
        address: impl Into<String>,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            topic: topic.into(),
            group: group.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check that every field required to join a group is present
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(ConsumerError::ConfigError(
                "broker address must not be empty".to_string(),
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(ConsumerError::ConfigError(
                "broker topic must not be empty".to_string(),
            ));
        }
        if self.group.trim().is_empty() {
            return Err(ConsumerError::ConfigError(
                "consumer group must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputConfiguration {
    /// Log payload content in addition to payload length
    pub verbose: bool,
}

/// Settings passed to the underlying Kafka client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Where to start when the group has no committed offset ("earliest" or "latest")
    pub auto_offset_reset: String,
    /// Group session timeout
    #[serde(deserialize_with = "deserialize_duration")]
    pub session_timeout: Duration,
    /// Protocol version assumed for brokers that do not report one
    pub broker_version_fallback: Option<String>,
    /// Number of messages buffered per partition claim
    pub claim_buffer_size: usize,
    /// Extra librdkafka properties, applied last
    pub properties: BTreeMap<String, String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_offset_reset: "latest".to_string(),
            session_timeout: Duration::from_secs(10),
            broker_version_fallback: Some("0.10.2.0".to_string()),
            claim_buffer_size: 256,
            properties: BTreeMap::new(),
        }
    }
}

/// Complete configuration of the monitor
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigStruct {
    pub broker: BrokerConfiguration,
    pub output: OutputConfiguration,
    pub client: ClientOptions,
}

impl ConfigStruct {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| ConsumerError::ConfigError(format!("invalid configuration: {e}")))
    }
}

/// Load configuration from a TOML file
pub fn load_configuration(path: impl AsRef<Path>) -> Result<ConfigStruct> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        ConsumerError::ConfigError(format!("unable to read {}: {e}", path.display()))
    })?;
    ConfigStruct::from_toml_str(&text)
}

/// Parse a duration string like "1h", "30m", "300s" or "300" (seconds)
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (number, multiplier) = if let Some(n) = text.strip_suffix("ms") {
        return n
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| format!("invalid milliseconds value {n:?}: {e}"));
    } else if let Some(n) = text.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1)
    } else {
        (text, 1)
    };

    let n = number
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid duration value {text:?}: {e}"))?;
    n.checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration {text:?} is too large"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> std::result::Result<Duration, String> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

// A zero timeout means "not configured".
fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    let duration = raw
        .map(RawDuration::into_duration)
        .transpose()
        .map_err(serde::de::Error::custom)?;
    Ok(duration.filter(|d| !d.is_zero()))
}
