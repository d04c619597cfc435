use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use tracing::{debug, info};

use super::{BrokerMessage, ClaimSession, ConsumerGroup, InitialOffset, KafkaSettings};
use crate::error::{BoxError, IngestError, Result};

/// Consumer group backed by librdkafka.
///
/// Offsets are stored manually when a message is marked and committed by the
/// client's auto-commit timer. A session counts as drained once a poll stays
/// empty for `session_idle_ms`.
pub struct RdKafkaConsumerGroup {
    consumer: Arc<StreamConsumer>,
    idle: Duration,
}

impl RdKafkaConsumerGroup {
    pub fn new(settings: &KafkaSettings) -> Result<Self> {
        let offset_reset = match settings.initial_offset {
            InitialOffset::Oldest => "earliest",
            InitialOffset::Newest => "latest",
        };
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &settings.group)
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("auto.offset.reset", offset_reset)
            .set("broker.version.fallback", settings.version.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| IngestError::Config(format!("failed to create consumer group: {e}")))?;
        info!(group = %settings.group, "Created librdkafka consumer group");
        Ok(Self {
            consumer: Arc::new(consumer),
            idle: Duration::from_millis(settings.session_idle_ms),
        })
    }
}

struct RdKafkaSession {
    consumer: Arc<StreamConsumer>,
    idle: Duration,
}

#[async_trait]
impl ClaimSession for RdKafkaSession {
    async fn next_message(&mut self) -> Option<std::result::Result<BrokerMessage, BoxError>> {
        match tokio::time::timeout(self.idle, self.consumer.recv()).await {
            Err(_) => None,
            Ok(Err(e)) => Some(Err(Box::new(e))),
            Ok(Ok(message)) => Some(Ok(BrokerMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
        }
    }

    fn mark_message(&mut self, message: &BrokerMessage) -> std::result::Result<(), BoxError> {
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)
            .map_err(|e| Box::new(e) as BoxError)
    }
}

#[async_trait]
impl ConsumerGroup for RdKafkaConsumerGroup {
    async fn join(&self, topics: &[String]) -> std::result::Result<Box<dyn ClaimSession>, BoxError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        debug!(?topics, "Subscribed consumer group");
        Ok(Box::new(RdKafkaSession {
            consumer: Arc::clone(&self.consumer),
            idle: self.idle,
        }))
    }

    async fn close(&self) -> std::result::Result<(), BoxError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}
