//! Pub/sub over the service's REST API (`v1`), using `reqwest`.
//!
//! Credentials are either a service account JSON document, exchanged for
//! access tokens through `gcp_auth`, or a raw bearer token. An emulator
//! endpoint may run without any.
//!
//! Acks and nacks are awaited; a failed request is logged and the message is
//! left for redelivery. A nack sets the ack deadline to zero so the message is
//! redelivered immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{AckHandle, MessageStream, PubSubClient, ReceivedMessage, Subscription};
use crate::error::{BoxError, IngestError, Result};

const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";
const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";
const PULL_BATCH: usize = 100;
const EMPTY_PULL_BACKOFF: Duration = Duration::from_millis(500);

enum Auth {
    Anonymous,
    Bearer(String),
    ServiceAccount(CustomServiceAccount),
}

struct RestApi {
    http: Client,
    base: String,
    project: String,
    auth: Auth,
}

impl RestApi {
    async fn authorize(&self, request: RequestBuilder) -> std::result::Result<RequestBuilder, BoxError> {
        Ok(match &self.auth {
            Auth::Anonymous => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::ServiceAccount(account) => {
                let token = account.token(&[PUBSUB_SCOPE]).await?;
                request.bearer_auth(token.as_str())
            }
        })
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/v1/projects/{}/topics/{}", self.base, self.project, topic)
    }

    fn subscription_url(&self, name: &str) -> String {
        format!("{}/v1/projects/{}/subscriptions/{}", self.base, self.project, name)
    }

    async fn post(&self, url: String, body: serde_json::Value) -> std::result::Result<reqwest::Response, BoxError> {
        let response = self.authorize(self.http.post(url)).await?.json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(format!("pub/sub returned {status}: {text}").into());
        }
        Ok(response)
    }

    async fn pull(&self, subscription_url: &str) -> std::result::Result<Vec<PulledMessage>, BoxError> {
        let response = self
            .post(
                format!("{subscription_url}:pull"),
                json!({ "maxMessages": PULL_BATCH }),
            )
            .await?;
        let pulled: PullResponse = response.json().await?;
        debug!(count = pulled.received_messages.len(), "Pulled messages");
        Ok(pulled.received_messages)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<PulledMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PulledMessage {
    ack_id: String,
    message: WireMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// REST pub/sub client.
pub struct RestPubSubClient {
    api: Arc<RestApi>,
}

impl RestPubSubClient {
    /// `credentials` is a service account JSON document, a bearer access token,
    /// or empty for an unauthenticated emulator.
    pub fn new(credentials: &str, project: &str, endpoint: Option<&str>) -> Result<Self> {
        let credentials = credentials.trim();
        let auth = if credentials.is_empty() {
            Auth::Anonymous
        } else if credentials.starts_with('{') {
            let account = CustomServiceAccount::from_json(credentials).map_err(|e| {
                error!(error = %e, "Failed to load service account credentials");
                IngestError::Config(format!("invalid service account credentials: {e}"))
            })?;
            info!("Using service account credentials");
            Auth::ServiceAccount(account)
        } else {
            Auth::Bearer(credentials.to_string())
        };
        let base = endpoint
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            api: Arc::new(RestApi {
                http: Client::new(),
                base,
                project: project.to_string(),
                auth,
            }),
        })
    }
}

#[async_trait]
impl PubSubClient for RestPubSubClient {
    async fn topic_exists(&self, topic: &str) -> std::result::Result<bool, BoxError> {
        let response = self
            .api
            .authorize(self.api.http.get(self.api.topic_url(topic)))
            .await?
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(format!("topic lookup returned {status}").into()),
        }
    }

    async fn create_topic(&self, topic: &str) -> std::result::Result<(), BoxError> {
        let response = self
            .api
            .authorize(self.api.http.put(self.api.topic_url(topic)))
            .await?
            .json(&json!({}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(format!("topic creation returned {}", response.status()).into());
        }
        Ok(())
    }

    fn subscription(&self, name: &str) -> Arc<dyn Subscription> {
        Arc::new(RestSubscription {
            api: Arc::clone(&self.api),
            url: self.api.subscription_url(name),
        })
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> std::result::Result<String, BoxError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let response = self
            .api
            .post(
                format!("{}:publish", self.api.topic_url(topic)),
                json!({ "messages": [{ "data": encoded }] }),
            )
            .await?;
        let published: PublishResponse = response.json().await?;
        published
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| "publish response carried no message id".into())
    }

    async fn close(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

struct RestSubscription {
    api: Arc<RestApi>,
    url: String,
}

/// Decodes a pulled message; on failure the error comes back with the
/// message's ack handle so the caller can nack it.
fn decode(
    api: &Arc<RestApi>,
    subscription_url: &str,
    pulled: PulledMessage,
) -> std::result::Result<ReceivedMessage, (base64::DecodeError, RestAckHandle)> {
    let handle = RestAckHandle {
        api: Arc::clone(api),
        subscription_url: subscription_url.to_string(),
        ack_id: pulled.ack_id,
    };
    let data = match base64::engine::general_purpose::STANDARD.decode(&pulled.message.data) {
        Ok(data) => data,
        Err(e) => return Err((e, handle)),
    };
    Ok(ReceivedMessage {
        id: pulled.message.message_id,
        data,
        attributes: pulled.message.attributes,
        publish_time: pulled.message.publish_time,
        handle: Box::new(handle),
    })
}

#[async_trait]
impl Subscription for RestSubscription {
    async fn receive(&self) -> std::result::Result<MessageStream, BoxError> {
        let state = (Arc::clone(&self.api), self.url.clone(), VecDeque::<PulledMessage>::new());
        let messages = stream::unfold(state, |(api, url, mut buffered)| async move {
            loop {
                if let Some(pulled) = buffered.pop_front() {
                    let message_id = pulled.message.message_id.clone();
                    match decode(&api, &url, pulled) {
                        Ok(message) => return Some((Ok(message), (api, url, buffered))),
                        Err((e, handle)) => {
                            warn!(error = %e, %message_id, "Message data is not valid base64, negatively acknowledging");
                            handle.nack().await;
                            continue;
                        }
                    }
                }
                match api.pull(&url).await {
                    Ok(batch) if batch.is_empty() => tokio::time::sleep(EMPTY_PULL_BACKOFF).await,
                    Ok(batch) => buffered.extend(batch),
                    Err(e) => return Some((Err(e), (api, url, buffered))),
                }
            }
        });
        Ok(messages.boxed())
    }
}

struct RestAckHandle {
    api: Arc<RestApi>,
    subscription_url: String,
    ack_id: String,
}

impl RestAckHandle {
    async fn send(&self, action: &'static str, body: serde_json::Value) {
        let url = format!("{}:{action}", self.subscription_url);
        match self.api.post(url, body).await {
            Ok(_) => debug!(action, ack_id = %self.ack_id, "Settled message"),
            Err(e) => error!(error = %e, action, ack_id = %self.ack_id, "Failed to settle message"),
        }
    }
}

#[async_trait]
impl AckHandle for RestAckHandle {
    async fn ack(&self) {
        self.send("acknowledge", json!({ "ackIds": [self.ack_id] })).await;
    }

    async fn nack(&self) {
        self.send(
            "modifyAckDeadline",
            json!({ "ackIds": [self.ack_id], "ackDeadlineSeconds": 0 }),
        )
        .await;
    }
}
