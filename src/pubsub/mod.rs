//! Pub/sub subscription ingestion adapter and publish processor.
//!
//! [`ConsumePubSub`] receives messages pushed by a subscription client and
//! either acknowledges each one on receipt or parks its [`AckHandle`] in a
//! [`DeferredAckRegistry`] until the pipeline reports a verdict through
//! [`CompletionNotifier::notify_completion`].
//!
//! A batch ends when `max_messages` have arrived, when no message has arrived
//! for `idle_timeout_ms`, or when the adapter is closed. Deferred entries stay
//! live after `execute` returns, so the pipeline can settle them.
//!
//! Messages may be handled concurrently (`max_concurrency`); the registry is
//! the only state shared between message arrival and completion notices.
//! Settlements triggered by notices run on tracked tasks that [`TriggerAdapter::close`]
//! waits for.

mod config;
mod publish;
mod rest;

pub use config::{ConsumePubSubConfig, PublishPubSubConfig};
pub use publish::PublishPubSub;
pub use rest::RestPubSubClient;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::contract::{
    CompletionNotice, CompletionNotifier, HandleFactory, Metadata, ScheduleType, TriggerAdapter,
    WorkUnit,
};
use crate::deferred_ack::{DeferredAckRegistry, Settlement, Verdict};
use crate::error::{BoxError, IngestError, Result};

const NAME: &str = "ConsumePubSub";

/// Source-native acknowledgment for one delivered message.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Commits delivery. Returns once the source has been told.
    async fn ack(&self);

    /// Asks the source to redeliver.
    async fn nack(&self);
}

pub struct ReceivedMessage {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub handle: Box<dyn AckHandle>,
}

pub type MessageStream = BoxStream<'static, std::result::Result<ReceivedMessage, BoxError>>;

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Opens the delivery stream. It ends only if the subscription is closed.
    async fn receive(&self) -> std::result::Result<MessageStream, BoxError>;
}

/// Managed pub/sub client.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> std::result::Result<bool, BoxError>;

    async fn create_topic(&self, topic: &str) -> std::result::Result<(), BoxError>;

    fn subscription(&self, name: &str) -> Arc<dyn Subscription>;

    /// Publishes one message and returns its server-assigned id.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> std::result::Result<String, BoxError>;

    async fn close(&self) -> std::result::Result<(), BoxError>;
}

/// Fails with [`IngestError::TopicMissing`] unless `topic` exists or may be created.
pub(crate) async fn ensure_topic(client: &dyn PubSubClient, topic: &str, create: bool) -> Result<()> {
    let exists = client.topic_exists(topic).await.map_err(|e| {
        error!(error = %e, %topic, "Failed to check if topic exists");
        IngestError::Client(e)
    })?;
    if exists {
        return Ok(());
    }
    if !create {
        error!(%topic, "Topic does not exist and create_topic is false");
        return Err(IngestError::TopicMissing(topic.to_string()));
    }
    client.create_topic(topic).await.map_err(|e| {
        error!(error = %e, %topic, "Failed to create topic");
        IngestError::Client(e)
    })?;
    info!(%topic, "Created topic");
    Ok(())
}

async fn apply(settlement: Settlement<Box<dyn AckHandle>>) {
    match settlement {
        Settlement::Ack(handle) => handle.ack().await,
        Settlement::Nack(handle) => handle.nack().await,
        Settlement::InFlight | Settlement::Unknown => {}
    }
}

/// Ends `stream` once no item arrives within `idle`.
fn until_idle(stream: MessageStream, idle: Duration) -> MessageStream {
    stream::unfold(stream, move |mut stream| async move {
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(item)) => Some((item, stream)),
            Ok(None) => None,
            Err(_) => {
                debug!(idle_ms = idle.as_millis() as u64, "Subscription idle, ending batch");
                None
            }
        }
    })
    .boxed()
}

pub struct ConsumePubSub {
    config: ConsumePubSubConfig,
    client: Arc<dyn PubSubClient>,
    subscription: Arc<dyn Subscription>,
    pending: DeferredAckRegistry<Box<dyn AckHandle>>,
    settlements: TaskTracker,
    cancel: CancellationToken,
}

impl ConsumePubSub {
    /// Validates `config`, ensures the topic exists (creating it when allowed)
    /// and binds the subscription.
    pub async fn connect(config: ConsumePubSubConfig, client: Arc<dyn PubSubClient>) -> Result<Self> {
        config.validate()?;
        ensure_topic(client.as_ref(), &config.topic, config.create_topic).await?;

        let subscription = client.subscription(&config.subscription_name);
        Ok(Self {
            config,
            client,
            subscription,
            pending: DeferredAckRegistry::new(),
            settlements: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Connects using the REST client built from `config`.
    pub async fn connect_rest(config: ConsumePubSubConfig) -> Result<Self> {
        config.validate()?;
        let client = RestPubSubClient::new(&config.credentials, &config.project, config.endpoint.as_deref())?;
        Self::connect(config, Arc::new(client)).await
    }

    /// Number of delivered messages still awaiting a verdict.
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    /// Applies a completion notice, waits for the resulting ack or nack and
    /// reports what happened to the message.
    pub async fn settle(&self, notice: CompletionNotice) -> Verdict {
        if self.config.ack_immediately {
            trace!(token = ?notice.token, "Immediate-ack mode, ignoring completion notice");
            return if notice.finished {
                Verdict::Unknown
            } else {
                Verdict::InFlight
            };
        }
        let settlement = self.pending.claim(notice);
        let verdict = settlement.verdict();
        apply(settlement).await;
        verdict
    }

    /// Waits for every settlement started by a completion notice.
    pub async fn flush(&self) {
        self.settlements.close();
        self.settlements.wait().await;
        self.settlements.reopen();
    }

    async fn handle_message(
        &self,
        message: ReceivedMessage,
        factory: &dyn HandleFactory,
    ) -> Option<WorkUnit> {
        let ReceivedMessage {
            id,
            data,
            attributes,
            publish_time,
            handle: ack,
        } = message;
        debug!(message_id = %id, size = data.len(), "Message received");

        let handle = factory.produce();
        if let Err(e) = handle.write(&data).await {
            error!(error = %e, message_id = %id, "Failed to write message data to handle");
            ack.nack().await;
            return None;
        }

        let mut metadata = Metadata::new();
        metadata.insert(format!("{NAME}.Topic"), json!(self.config.topic));
        metadata.insert(format!("{NAME}.MessageID"), json!(id));
        if let Some(published) = publish_time {
            metadata.insert(
                format!("{NAME}.PublishTime"),
                json!(published.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        for (key, value) in attributes {
            metadata.insert(format!("{NAME}.Attributes.{key}"), json!(value));
        }

        let mut unit = WorkUnit::new(metadata, handle);
        if self.config.ack_immediately {
            ack.ack().await;
        } else {
            unit.token = Some(self.pending.defer(ack));
        }
        Some(unit)
    }
}

impl CompletionNotifier for ConsumePubSub {
    fn notify_completion(&self, notice: CompletionNotice) {
        if self.config.ack_immediately {
            trace!(token = ?notice.token, "Immediate-ack mode, ignoring completion notice");
            return;
        }
        let settlement = self.pending.claim(notice);
        let verdict = settlement.verdict();
        if matches!(verdict, Verdict::Acked | Verdict::Nacked) {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    self.settlements.spawn_on(apply(settlement), &runtime);
                }
                Err(_) => warn!(?verdict, "No runtime to settle on, leaving message for redelivery"),
            }
        }
        debug!(?verdict, "Completion notice applied");
    }
}

#[async_trait]
impl TriggerAdapter for ConsumePubSub {
    fn name(&self) -> &'static str {
        NAME
    }

    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::EventDriven
    }

    #[instrument(level = "debug", skip_all, fields(subscription = %self.config.subscription_name))]
    async fn execute(&self, factory: &dyn HandleFactory) -> Result<Vec<WorkUnit>> {
        if self.cancel.is_cancelled() {
            debug!("Adapter closed, producing no work units");
            return Ok(Vec::new());
        }

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Vec::new()),
            opened = self.subscription.receive() => opened.map_err(|e| {
                error!(error = %e, "Failed to open subscription");
                IngestError::session(NAME, e)
            })?,
        };
        let stream = until_idle(stream, self.config.idle_timeout());
        let stream = match self.config.max_messages {
            Some(limit) => stream.take(limit).boxed(),
            None => stream,
        };

        let units = Mutex::new(Vec::new());
        let received = stream
            .take_until(self.cancel.cancelled())
            .try_for_each_concurrent(self.config.max_concurrency(), |message| {
                let units = &units;
                async move {
                    if let Some(unit) = self.handle_message(message, factory).await {
                        units
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(unit);
                    }
                    Ok(())
                }
            })
            .await;

        if let Err(e) = received {
            error!(error = %e, "Subscription receive failed");
            return Err(IngestError::session(NAME, e));
        }

        let units = units.into_inner().unwrap_or_else(PoisonError::into_inner);
        debug!(
            produced = units.len(),
            pending_acks = self.pending.len(),
            "Completed ConsumePubSub execution"
        );
        Ok(units)
    }

    async fn close(&self) -> Result<()> {
        info!(subscription = %self.config.subscription_name, "Closing ConsumePubSub");
        self.cancel.cancel();
        self.settlements.close();
        self.settlements.wait().await;
        let abandoned = self.pending.drain();
        if !abandoned.is_empty() {
            warn!(
                count = abandoned.len(),
                "Dropping unsettled deferred acknowledgments; the source will redeliver"
            );
        }
        self.client.close().await.map_err(IngestError::Client)
    }
}
