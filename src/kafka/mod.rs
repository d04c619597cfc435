//! Broker-topic ingestion adapter and publish processor.
//!
//! [`ConsumeKafka`] joins a consumer group and drains one claim session per
//! `execute`. Every claimed message is written to a fresh handle and marked as
//! processed before the next one is read, so acknowledgment happens at
//! delivery, independent of what the pipeline later does with the unit.
//!
//! [`PublishKafka`] is the outbound half: it sends a unit's payload as one
//! record and records where the broker placed it.
//!
//! The group client sits behind [`ConsumerGroup`]/[`ClaimSession`] and the
//! producer behind [`Producer`]; the librdkafka-backed implementations are
//! compiled with the `kafka` feature.

mod config;
mod publish;
#[cfg(feature = "kafka")]
mod rdkafka_group;
#[cfg(feature = "kafka")]
mod rdkafka_producer;

pub use config::{
    ConsumeKafkaConfig, InitialOffset, KafkaSettings, ProtocolVersion, DEFAULT_PROTOCOL_VERSION,
};
#[cfg(any(test, feature = "test-export-mocks"))]
pub use publish::MockProducer;
pub use publish::{Producer, ProducerSettings, PublishKafka, PublishKafkaConfig, RequiredAcks};
#[cfg(feature = "kafka")]
pub use rdkafka_group::RdKafkaConsumerGroup;
#[cfg(feature = "kafka")]
pub use rdkafka_producer::RdKafkaProducer;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::contract::{
    CompletionNotice, CompletionNotifier, HandleFactory, Metadata, ScheduleType, TriggerAdapter,
    WorkUnit,
};
use crate::error::{BoxError, IngestError, Result};

const NAME: &str = "ConsumeKafka";

/// One record claimed from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// A joined consumer-group session yielding claimed messages.
#[async_trait]
pub trait ClaimSession: Send {
    /// Next claimed message; `None` once the session is drained.
    async fn next_message(&mut self) -> Option<std::result::Result<BrokerMessage, BoxError>>;

    /// Marks `message` as processed so its offset is committed.
    fn mark_message(&mut self, message: &BrokerMessage) -> std::result::Result<(), BoxError>;
}

/// Consumer-group client.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Joins the group on `topics` and opens a claim session.
    async fn join(&self, topics: &[String]) -> std::result::Result<Box<dyn ClaimSession>, BoxError>;

    async fn close(&self) -> std::result::Result<(), BoxError>;
}

pub struct ConsumeKafka {
    settings: KafkaSettings,
    group: Arc<dyn ConsumerGroup>,
    cancel: CancellationToken,
}

impl ConsumeKafka {
    /// Validates `config` and binds the adapter to an existing group client.
    pub fn new(config: &ConsumeKafkaConfig, group: Arc<dyn ConsumerGroup>) -> Result<Self> {
        let settings = config.validate()?;
        Ok(Self::with_settings(settings, group))
    }

    pub fn with_settings(settings: KafkaSettings, group: Arc<dyn ConsumerGroup>) -> Self {
        Self {
            settings,
            group,
            cancel: CancellationToken::new(),
        }
    }

    /// Validates `config` and connects a librdkafka consumer group.
    #[cfg(feature = "kafka")]
    pub fn connect(config: &ConsumeKafkaConfig) -> Result<Self> {
        let settings = config.validate()?;
        let group = RdKafkaConsumerGroup::new(&settings)?;
        Ok(Self::with_settings(settings, Arc::new(group)))
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }

    async fn drain_session(
        &self,
        session: &mut dyn ClaimSession,
        factory: &dyn HandleFactory,
        units: &mut Vec<WorkUnit>,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(produced = units.len(), "Claim session cancelled");
                    return Ok(());
                }
                next = session.next_message() => next,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    error!(error = %e, "Claim session failed");
                    return Err(IngestError::session(NAME, e));
                }
                None => return Ok(()),
            };
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Message claimed"
            );

            let handle = factory.produce();
            if let Err(e) = handle.write(&message.value).await {
                error!(
                    error = %e,
                    topic = %message.topic,
                    offset = message.offset,
                    "Failed to write message payload, aborting claim session"
                );
                return Err(IngestError::Io(e));
            }

            session
                .mark_message(&message)
                .map_err(|e| IngestError::session(NAME, e))?;

            let mut metadata = Metadata::new();
            metadata.insert(format!("{NAME}.Topic"), json!(message.topic));
            metadata.insert(format!("{NAME}.Partition"), json!(message.partition));
            metadata.insert(format!("{NAME}.Offset"), json!(message.offset));
            units.push(WorkUnit::new(metadata, handle));
        }
    }
}

impl CompletionNotifier for ConsumeKafka {
    fn notify_completion(&self, notice: CompletionNotice) {
        // Messages are marked at delivery; there is nothing left to settle.
        trace!(token = ?notice.token, finished = notice.finished, "Ignoring completion notice");
    }
}

#[async_trait]
impl TriggerAdapter for ConsumeKafka {
    fn name(&self) -> &'static str {
        NAME
    }

    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::EventDriven
    }

    #[instrument(level = "debug", skip_all, fields(group = %self.settings.group))]
    async fn execute(&self, factory: &dyn HandleFactory) -> Result<Vec<WorkUnit>> {
        if self.cancel.is_cancelled() {
            debug!("Adapter closed, producing no work units");
            return Ok(Vec::new());
        }

        let mut session = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Vec::new()),
            joined = self.group.join(&self.settings.topics) => {
                joined.map_err(|e| {
                    error!(error = %e, "Failed to join consumer group");
                    IngestError::session(NAME, e)
                })?
            }
        };

        let mut units = Vec::new();
        self.drain_session(session.as_mut(), factory, &mut units)
            .await?;
        info!(produced = units.len(), "Claim session drained");
        Ok(units)
    }

    async fn close(&self) -> Result<()> {
        info!(group = %self.settings.group, "Closing ConsumeKafka");
        self.cancel.cancel();
        self.group.close().await.map_err(|e| {
            warn!(error = %e, "Failed to close consumer group");
            IngestError::Client(e)
        })
    }
}
