use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{IngestError, Result};

const DEFAULT_MAX_CONCURRENCY: usize = 8;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 2000;

/// Configuration for [`super::ConsumePubSub`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumePubSubConfig {
    /// Service account JSON document or OAuth access token; may be empty when
    /// `endpoint` points at an emulator.
    #[serde(default)]
    pub credentials: String,
    pub project: String,
    pub topic: String,
    pub subscription_name: String,
    /// Create the topic when it does not exist instead of failing setup.
    #[serde(default)]
    pub create_topic: bool,
    /// Ack on receipt instead of waiting for the pipeline's completion notice.
    #[serde(default)]
    pub ack_immediately: bool,
    /// REST base URL override, e.g. a local emulator.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Return the batch after this many messages.
    #[serde(default)]
    pub max_messages: Option<usize>,
    /// Return the batch once no message has arrived for this long.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl ConsumePubSubConfig {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("project", &self.project),
            ("topic", &self.topic),
            ("subscription_name", &self.subscription_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(IngestError::Config(format!("{field} is required")));
            }
        }
        if self.credentials.trim().is_empty() && self.endpoint.is_none() {
            return Err(IngestError::Config(
                "credentials are required unless an emulator endpoint is set".into(),
            ));
        }
        if self.max_messages == Some(0) {
            return Err(IngestError::Config("max_messages must be positive".into()));
        }
        if self.idle_timeout_ms == Some(0) {
            return Err(IngestError::Config("idle_timeout_ms must be positive".into()));
        }
        info!(
            project = %self.project,
            topic = %self.topic,
            subscription = %self.subscription_name,
            ack_immediately = self.ack_immediately,
            "Validated ConsumePubSub config"
        );
        Ok(())
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS))
    }
}

/// Configuration for [`super::PublishPubSub`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishPubSubConfig {
    #[serde(default)]
    pub credentials: String,
    pub project: String,
    pub topic: String,
    #[serde(default)]
    pub create_topic: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl PublishPubSubConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("project", &self.project), ("topic", &self.topic)] {
            if value.trim().is_empty() {
                return Err(IngestError::Config(format!("{field} is required")));
            }
        }
        if self.credentials.trim().is_empty() && self.endpoint.is_none() {
            return Err(IngestError::Config(
                "credentials are required unless an emulator endpoint is set".into(),
            ));
        }
        info!(project = %self.project, topic = %self.topic, "Validated PublishPubSub config");
        Ok(())
    }
}
