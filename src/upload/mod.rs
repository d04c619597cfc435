//! HTTP upload processor: POSTs a work unit's payload to a configured URL.
//!
//! The request body is either streamed through a [`StreamingSession`] (bounded
//! memory for multipart; base64 still buffers for template rendering) or built
//! fully in memory first. The response status, and optionally its body and
//! headers, are recorded in the unit's metadata under `UploadHTTP.*`.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Body, Client};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument, warn};

use crate::contract::{ByteHandle, Metadata};
use crate::error::{IngestError, Result};
use crate::transfer::{
    encode_base64, render_base64_template, MultipartFraming, MultipartPart, StreamingSession,
};

const NAME: &str = "UploadHTTP";
const DEFAULT_MULTIPART_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendFileType {
    #[default]
    Multipart,
    Base64,
}

/// Configuration for [`UploadHttp`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadHttpConfig {
    pub url: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(rename = "type", default)]
    pub send_type: SendFileType,
    /// Replace the handle's contents with the response body.
    #[serde(default)]
    pub put_response_as_contents: bool,
    #[serde(default)]
    pub multipart_field_name: Option<String>,
    #[serde(default)]
    pub multipart_filename: Option<String>,
    #[serde(default)]
    pub multipart_content_type: Option<String>,
    /// Body template; `{{.Base64Contents}}` is replaced by the encoded payload.
    #[serde(default)]
    pub base64_body_format: Option<String>,
    #[serde(default)]
    pub write_response_to_metadata: bool,
    #[serde(default)]
    pub use_streaming: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl UploadHttpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(IngestError::Config("url is required".into()));
        }
        match self.send_type {
            SendFileType::Multipart if non_empty(&self.multipart_field_name).is_none() => Err(
                IngestError::Config("multipart field name is required for multipart type".into()),
            ),
            SendFileType::Base64 if non_empty(&self.base64_body_format).is_none() => Err(
                IngestError::Config("base64 format is required for base64 type".into()),
            ),
            _ => Ok(()),
        }
    }

    /// The multipart part description with defaults applied.
    pub fn multipart_part(&self) -> MultipartPart {
        let field_name = non_empty(&self.multipart_field_name)
            .unwrap_or_default()
            .to_string();
        MultipartPart {
            filename: non_empty(&self.multipart_filename)
                .map(str::to_string)
                .unwrap_or_else(|| field_name.clone()),
            content_type: non_empty(&self.multipart_content_type)
                .unwrap_or(DEFAULT_MULTIPART_CONTENT_TYPE)
                .to_string(),
            field_name,
        }
    }

    fn base64_template(&self) -> &str {
        non_empty(&self.base64_body_format).unwrap_or_default()
    }
}

/// Combines the request result with the body producer's result.
///
/// A transport error wins over the producer's. A producer that ends with
/// `BrokenPipe` after a response arrived means the server answered before
/// reading the whole body, so that response is kept. Any other producer
/// failure means the server saw a truncated body.
fn streamed_outcome(
    sent: reqwest::Result<reqwest::Response>,
    produced: io::Result<u64>,
) -> Result<reqwest::Response> {
    match (sent, produced) {
        (Err(e), produced) => {
            if let Err(producer) = produced {
                debug!(error = %producer, "Request body producer stopped");
            }
            error!(error = %e, "Failed to send HTTP request");
            Err(IngestError::Http(e))
        }
        (Ok(response), Ok(written)) => {
            debug!(bytes = written, "Streamed request body");
            Ok(response)
        }
        (Ok(response), Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
            warn!(
                error = %e,
                status = %response.status(),
                "Server responded before reading the whole request body"
            );
            Ok(response)
        }
        (Ok(_), Err(e)) => {
            error!(error = %e, "Request body producer failed");
            Err(IngestError::Io(e))
        }
    }
}

pub struct UploadHttp {
    config: UploadHttpConfig,
    client: Client,
}

impl UploadHttp {
    pub fn new(config: UploadHttpConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build()?;
        info!(
            url = %config.url,
            send_type = ?config.send_type,
            streaming = config.use_streaming,
            "Configured UploadHTTP"
        );
        Ok(Self { config, client })
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn config(&self) -> &UploadHttpConfig {
        &self.config
    }

    /// Uploads the handle's contents and records the outcome in `metadata`.
    #[instrument(level = "debug", skip_all, fields(url = %self.config.url))]
    pub async fn execute(&self, metadata: &mut Metadata, handle: &dyn ByteHandle) -> Result<()> {
        let response = if self.config.use_streaming {
            self.send_streaming(handle).await?
        } else {
            self.send_buffered(handle).await?
        };

        let status = response.status();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let body = response.bytes().await.map_err(|e| {
            error!(error = %e, "Failed to read response body");
            IngestError::Http(e)
        })?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body).into_owned();
            error!(%status, %body, "Received non-2xx response");
            return Err(IngestError::UnexpectedStatus { status, body });
        }
        debug!(%status, size = body.len(), "Upload succeeded");

        if self.config.put_response_as_contents {
            handle.write(&body).await.map_err(|e| {
                error!(error = %e, "Failed to write response to handle");
                IngestError::Io(e)
            })?;
        }

        metadata.insert(format!("{NAME}.ResponseStatusCode"), json!(status.as_u16()));
        if self.config.write_response_to_metadata {
            metadata.insert(
                format!("{NAME}.ResponseBody"),
                json!(String::from_utf8_lossy(&body)),
            );
            metadata.insert(format!("{NAME}.ResponseHeaders"), json!(headers));
        }
        metadata.insert(format!("{NAME}.URL"), json!(self.config.url));
        Ok(())
    }

    fn request(&self, body: Body, content_type: Option<&str>) -> Result<reqwest::RequestBuilder> {
        let mut request = self.client.post(&self.config.url).body(body);
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        for (key, value) in &self.config.extra_headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| IngestError::Config(format!("invalid header name {key:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| IngestError::Config(format!("invalid value for header {key:?}: {e}")))?;
            request = request.header(name, value);
        }
        Ok(request)
    }

    async fn send_streaming(&self, handle: &dyn ByteHandle) -> Result<reqwest::Response> {
        let source = handle.reader().await.map_err(|e| {
            error!(error = %e, "Failed to read handle");
            IngestError::Io(e)
        })?;
        let session = match self.config.send_type {
            SendFileType::Multipart => StreamingSession::multipart(
                source,
                self.config.multipart_part(),
                MultipartFraming::new(),
            ),
            SendFileType::Base64 => {
                StreamingSession::base64(source, self.config.base64_template()).await?
            }
        };
        let (body, content_type, producer) = session.into_parts();
        let request = self.request(Body::from(body), content_type.as_deref())?;

        let sent = request.send().await;
        let produced = producer.finish().await;
        streamed_outcome(sent, produced)
    }

    async fn send_buffered(&self, handle: &dyn ByteHandle) -> Result<reqwest::Response> {
        let mut source = handle.reader().await.map_err(|e| {
            error!(error = %e, "Failed to read handle");
            IngestError::Io(e)
        })?;
        let (body, content_type) = match self.config.send_type {
            SendFileType::Multipart => {
                let framing = MultipartFraming::new();
                let mut body = framing.header(&self.config.multipart_part()).into_bytes();
                source.read_to_end(&mut body).await?;
                body.extend_from_slice(framing.trailer().as_bytes());
                (body, Some(framing.content_type()))
            }
            SendFileType::Base64 => {
                let encoded = encode_base64(&mut source).await?;
                let rendered = render_base64_template(self.config.base64_template(), &encoded)?;
                (rendered.into_bytes(), None)
            }
        };
        debug!(size = body.len(), "Built in-memory request body");
        self.request(Body::from(body), content_type.as_deref())?
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to send HTTP request");
                IngestError::Http(e)
            })
    }
}
