use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use tracing::info;

use super::{Producer, ProducerSettings};
use crate::error::{BoxError, IngestError, Result};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Producer backed by librdkafka; each send waits for its delivery report.
pub struct RdKafkaProducer {
    producer: FutureProducer,
}

impl RdKafkaProducer {
    pub fn new(settings: &ProducerSettings) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("acks", settings.acks.as_setting())
            .create()
            .map_err(|e| IngestError::Config(format!("failed to create producer: {e}")))?;
        info!(topic = %settings.topic, acks = ?settings.acks, "Created librdkafka producer");
        Ok(Self { producer })
    }
}

#[async_trait]
impl Producer for RdKafkaProducer {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> std::result::Result<(i32, i64), BoxError> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(&payload);
        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| Box::new(e) as BoxError)
    }

    async fn close(&self) -> std::result::Result<(), BoxError> {
        self.producer.flush(FLUSH_TIMEOUT)?;
        Ok(())
    }
}
