use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument};

use super::config::split_list;
use crate::contract::{ByteHandle, Metadata};
use crate::error::{BoxError, IngestError, Result};

const NAME: &str = "PublishKafka";

/// Broker acknowledgment a produce request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    /// Every in-sync replica.
    All,
    /// No response at all.
    None,
    /// The partition leader only.
    Local,
}

impl FromStr for RequiredAcks {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(RequiredAcks::All),
            "none" => Ok(RequiredAcks::None),
            "local" => Ok(RequiredAcks::Local),
            _ => Err(IngestError::Config(format!("invalid acks value: {s}"))),
        }
    }
}

impl RequiredAcks {
    /// Value of the producer's `acks` setting.
    pub fn as_setting(self) -> &'static str {
        match self {
            RequiredAcks::All => "all",
            RequiredAcks::None => "0",
            RequiredAcks::Local => "1",
        }
    }
}

/// Raw configuration for [`PublishKafka`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishKafkaConfig {
    /// Comma separated list of brokers.
    pub bootstrap_servers: String,
    pub topic: String,
    /// `all`, `none` or `local`.
    pub acks: String,
}

/// Validated settings a producer is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    pub acks: RequiredAcks,
}

impl PublishKafkaConfig {
    pub fn validate(&self) -> Result<ProducerSettings> {
        let acks = self.acks.parse()?;
        let brokers = split_list(&self.bootstrap_servers);
        if brokers.is_empty() {
            return Err(IngestError::Config("bootstrap servers are required".into()));
        }
        if self.topic.trim().is_empty() {
            return Err(IngestError::Config("topic is required".into()));
        }
        let settings = ProducerSettings {
            brokers,
            topic: self.topic.trim().to_string(),
            acks,
        };
        info!(topic = %settings.topic, brokers = ?settings.brokers, acks = ?settings.acks, "Validated PublishKafka config");
        Ok(settings)
    }
}

/// Synchronous producer: `send` returns once the broker has placed the record.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Producer: Send + Sync {
    /// Sends `payload` to `topic`, returning the record's partition and offset.
    async fn send(&self, topic: &str, payload: Vec<u8>) -> std::result::Result<(i32, i64), BoxError>;

    async fn close(&self) -> std::result::Result<(), BoxError>;
}

/// Publishes a work unit's payload as one broker record.
pub struct PublishKafka {
    settings: ProducerSettings,
    producer: Arc<dyn Producer>,
}

impl PublishKafka {
    pub fn new(config: &PublishKafkaConfig, producer: Arc<dyn Producer>) -> Result<Self> {
        Ok(Self {
            settings: config.validate()?,
            producer,
        })
    }

    /// Validates `config` and connects a librdkafka producer.
    #[cfg(feature = "kafka")]
    pub fn connect(config: &PublishKafkaConfig) -> Result<Self> {
        let settings = config.validate()?;
        let producer = super::RdKafkaProducer::new(&settings)?;
        Ok(Self {
            settings,
            producer: Arc::new(producer),
        })
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    #[instrument(level = "debug", skip_all, fields(topic = %self.settings.topic))]
    pub async fn execute(&self, metadata: &mut Metadata, handle: &dyn ByteHandle) -> Result<()> {
        let mut reader = handle.reader().await.map_err(|e| {
            error!(error = %e, "Failed to get reader for handle");
            IngestError::Io(e)
        })?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.map_err(|e| {
            error!(error = %e, "Failed to read data from handle");
            IngestError::Io(e)
        })?;

        let topic = &self.settings.topic;
        let (partition, offset) = self.producer.send(topic, data).await.map_err(|e| {
            error!(error = %e, %topic, "Failed to publish message");
            IngestError::Client(e)
        })?;
        info!(%topic, partition, offset, "Message published");

        metadata.insert(format!("{NAME}.Topic"), json!(topic));
        metadata.insert(format!("{NAME}.Partition"), json!(partition));
        metadata.insert(format!("{NAME}.Offset"), json!(offset));
        debug!("Completed PublishKafka execution");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.producer.close().await.map_err(IngestError::Client)
    }
}
