//! Streaming transfer: present a byte source as an outbound request body.
//!
//! A [`StreamingSession`] owns the consumer end of a [`pipe`] (handed to the
//! request as its body) and the join handle of the single producer task that
//! encodes the source into the pipe. Two encodings are supported:
//!
//! - **multipart**: framing headers, the source copied chunk by chunk, a
//!   trailer. Memory use is bounded by the pipe capacity.
//! - **base64 template**: the source is transcoded to base64 and substituted
//!   into a text template. Rendering needs the whole encoded text, so this
//!   path buffers the payload before the producer starts.
//!
//! A producer failure closes the pipe with an error of the same kind and
//! message, so the request reading the body fails instead of hanging.

pub mod pipe;

pub use pipe::{pipe, PipeReader, PipeWriter, DEFAULT_CAPACITY};

use std::io;
use std::sync::OnceLock;

use base64::Engine;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{IngestError, Result};

const COPY_CHUNK: usize = 64 * 1024;

/// Template placeholder replaced by the base64 payload.
pub const BASE64_PLACEHOLDER: &str = "Base64Contents";

/// Describes the single file part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub field_name: String,
    pub filename: String,
    pub content_type: String,
}

/// Multipart framing with a fixed boundary.
#[derive(Debug, Clone)]
pub struct MultipartFraming {
    boundary: String,
}

impl Default for MultipartFraming {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartFraming {
    pub fn new() -> Self {
        Self::with_boundary(Uuid::new_v4().simple().to_string())
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn header(&self, part: &MultipartPart) -> String {
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            self.boundary,
            escape_quotes(&part.field_name),
            escape_quotes(&part.filename),
            part.content_type
        )
    }

    pub fn trailer(&self) -> String {
        format!("\r\n--{}--\r\n", self.boundary)
    }
}

fn escape_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn placeholder_regex() -> Result<&'static Regex> {
    static PLACEHOLDER: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*\.(\w+)\s*\}\}"))
        .as_ref()
        .map_err(|e| IngestError::Template(e.to_string()))
}

/// Substitutes `{{.Base64Contents}}` in `template` with `encoded`.
pub fn render_base64_template(template: &str, encoded: &str) -> Result<String> {
    let placeholder = placeholder_regex()?;
    if let Some(unknown) = placeholder
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .find(|name| name != BASE64_PLACEHOLDER)
    {
        return Err(IngestError::Template(format!(
            "unknown template field {unknown:?}"
        )));
    }
    Ok(placeholder
        .replace_all(template, regex::NoExpand(encoded))
        .into_owned())
}

/// Reads `source` to the end and returns its standard base64 encoding.
pub async fn encode_base64<R>(source: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = Vec::new();
    source.read_to_end(&mut raw).await?;
    Ok(base64::engine::general_purpose::STANDARD.encode(raw))
}

async fn copy_into<R>(source: &mut R, writer: &mut PipeWriter) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(copied);
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
}

/// One in-flight transfer: the body for the outbound call and its producer task.
pub struct StreamingSession {
    body: PipeReader,
    content_type: Option<String>,
    producer: JoinHandle<io::Result<u64>>,
}

impl StreamingSession {
    /// Spawns `produce` as the single producer for a new pipe.
    ///
    /// `produce` writes into the pipe; on success the pipe is closed, on error
    /// it is closed with that error and the error is returned from [`finish`].
    ///
    /// [`finish`]: ProducerHandle::finish
    pub fn spawn<F, Fut>(capacity: usize, content_type: Option<String>, produce: F) -> Self
    where
        F: FnOnce(PipeWriter) -> Fut,
        Fut: std::future::Future<Output = (PipeWriter, io::Result<u64>)> + Send + 'static,
    {
        let (writer, body) = pipe(capacity);
        let task = produce(writer);
        let producer = tokio::spawn(async move {
            let (writer, outcome) = task.await;
            match outcome {
                Ok(written) => {
                    debug!(bytes = written, "Producer finished");
                    writer.close();
                    Ok(written)
                }
                Err(e) => {
                    error!(error = %e, "Producer failed, closing pipe with error");
                    writer
                        .close_with_error(io::Error::new(e.kind(), e.to_string()))
                        .await;
                    Err(e)
                }
            }
        });
        Self {
            body,
            content_type,
            producer,
        }
    }

    /// Streams `source` as a multipart body with a single file part.
    pub fn multipart<R>(source: R, part: MultipartPart, framing: MultipartFraming) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let content_type = framing.content_type();
        debug!(%content_type, filename = %part.filename, "Streaming multipart body");
        Self::spawn(DEFAULT_CAPACITY, Some(content_type), move |mut writer| async move {
            let mut source = source;
            let outcome = async {
                let header = framing.header(&part);
                writer.write_all(header.as_bytes()).await?;
                let copied = copy_into(&mut source, &mut writer).await?;
                let trailer = framing.trailer();
                writer.write_all(trailer.as_bytes()).await?;
                Ok::<u64, io::Error>(header.len() as u64 + copied + trailer.len() as u64)
            }
            .await;
            (writer, outcome)
        })
    }

    /// Transcodes `source` to base64, renders it into `template`, then streams the result.
    ///
    /// Template errors are reported here, before any producer is spawned.
    pub async fn base64<R>(mut source: R, template: &str) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin,
    {
        let encoded = encode_base64(&mut source).await?;
        let rendered = render_base64_template(template, &encoded)?.into_bytes();
        debug!(bytes = rendered.len(), "Rendered base64 body");
        Ok(Self::spawn(DEFAULT_CAPACITY, None, move |mut writer| async move {
            let mut written = 0u64;
            let mut outcome: io::Result<u64> = Ok(0);
            for chunk in rendered.chunks(COPY_CHUNK) {
                if let Err(e) = writer.write_all(chunk).await {
                    outcome = Err(e);
                    break;
                }
                written += chunk.len() as u64;
                outcome = Ok(written);
            }
            (writer, outcome)
        }))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Splits into the request body and the producer handle.
    pub fn into_parts(self) -> (PipeReader, Option<String>, ProducerHandle) {
        (
            self.body,
            self.content_type,
            ProducerHandle {
                task: self.producer,
            },
        )
    }
}

/// Completion handle of a session's producer task.
pub struct ProducerHandle {
    task: JoinHandle<io::Result<u64>>,
}

impl ProducerHandle {
    /// Waits for the producer and returns the number of bytes it wrote.
    pub async fn finish(self) -> io::Result<u64> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(join) => Err(io::Error::other(format!("producer task failed: {join}"))),
        }
    }
}
