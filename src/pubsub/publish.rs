use std::sync::Arc;

use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument};

use super::{ensure_topic, PubSubClient, PublishPubSubConfig, RestPubSubClient};
use crate::contract::{ByteHandle, Metadata};
use crate::error::{IngestError, Result};

const NAME: &str = "PublishPubSub";

/// Publishes a work unit's payload as one pub/sub message.
pub struct PublishPubSub {
    config: PublishPubSubConfig,
    client: Arc<dyn PubSubClient>,
}

impl PublishPubSub {
    /// Validates `config` and ensures the topic exists, creating it when allowed.
    pub async fn connect(config: PublishPubSubConfig, client: Arc<dyn PubSubClient>) -> Result<Self> {
        config.validate()?;
        ensure_topic(client.as_ref(), &config.topic, config.create_topic).await?;
        Ok(Self { config, client })
    }

    pub async fn connect_rest(config: PublishPubSubConfig) -> Result<Self> {
        config.validate()?;
        let client = RestPubSubClient::new(&config.credentials, &config.project, config.endpoint.as_deref())?;
        Self::connect(config, Arc::new(client)).await
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(level = "debug", skip_all, fields(topic = %self.config.topic))]
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

        let message_id = self
            .client
            .publish(&self.config.topic, data)
            .await
            .map_err(|e| {
                error!(error = %e, topic = %self.config.topic, "Failed to publish message");
                IngestError::Client(e)
            })?;
        info!(topic = %self.config.topic, %message_id, "Message published");

        metadata.insert(format!("{NAME}.Topic"), json!(self.config.topic));
        metadata.insert(format!("{NAME}.MessageID"), json!(message_id));
        debug!("Completed PublishPubSub execution");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.client.close().await.map_err(IngestError::Client)
    }
}
