use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{IngestError, Result};

/// Protocol version used when `kafka_version` is unset.
pub const DEFAULT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion([2, 1, 0, 0]);

const DEFAULT_SESSION_IDLE_MS: u64 = 1000;

/// Raw configuration for [`super::ConsumeKafka`], as found in YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumeKafkaConfig {
    /// Comma separated list of topics.
    pub topic_names: String,
    /// Comma separated list of brokers.
    pub bootstrap_servers: String,
    pub consumer_group: String,
    #[serde(default)]
    pub kafka_version: Option<String>,
    #[serde(default)]
    pub start_from_oldest: bool,
    /// How long an empty poll waits before the claim session counts as drained.
    #[serde(default)]
    pub session_idle_ms: Option<u64>,
}

/// Where a consumer group starts when it has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialOffset {
    Oldest,
    Newest,
}

/// Broker protocol version, `major.minor.patch[.fix]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion([u16; 4]);

impl FromStr for ProtocolVersion {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(IngestError::InvalidVersion(s.to_string()));
        }
        let mut version = [0u16; 4];
        for (slot, part) in version.iter_mut().zip(parts) {
            *slot = part
                .parse()
                .map_err(|_| IngestError::InvalidVersion(s.to_string()))?;
        }
        Ok(ProtocolVersion(version))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch, fix] = self.0;
        write!(f, "{major}.{minor}.{patch}")?;
        if fix != 0 {
            write!(f, ".{fix}")?;
        }
        Ok(())
    }
}

/// Validated settings a consumer group client is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub topics: Vec<String>,
    pub brokers: Vec<String>,
    pub group: String,
    pub version: ProtocolVersion,
    pub initial_offset: InitialOffset,
    pub session_idle_ms: u64,
}

pub(crate) fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl ConsumeKafkaConfig {
    pub fn validate(&self) -> Result<KafkaSettings> {
        if self.consumer_group.trim().is_empty() {
            return Err(IngestError::Config("consumer group is required".into()));
        }
        let brokers = split_list(&self.bootstrap_servers);
        if brokers.is_empty() {
            return Err(IngestError::Config("bootstrap servers are required".into()));
        }
        let topics = split_list(&self.topic_names);
        if topics.is_empty() {
            return Err(IngestError::Config("at least one topic is required".into()));
        }

        let version = match self.kafka_version.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => v.parse()?,
            _ => {
                warn!(default = %DEFAULT_PROTOCOL_VERSION, "kafka version not found, will use default");
                DEFAULT_PROTOCOL_VERSION
            }
        };

        let initial_offset = if self.start_from_oldest {
            InitialOffset::Oldest
        } else {
            InitialOffset::Newest
        };

        let settings = KafkaSettings {
            topics,
            brokers,
            group: self.consumer_group.trim().to_string(),
            version,
            initial_offset,
            session_idle_ms: self.session_idle_ms.unwrap_or(DEFAULT_SESSION_IDLE_MS),
        };
        info!(
            group = %settings.group,
            topics = ?settings.topics,
            brokers = ?settings.brokers,
            version = %settings.version,
            initial_offset = ?settings.initial_offset,
            "Validated ConsumeKafka config"
        );
        Ok(settings)
    }
}
