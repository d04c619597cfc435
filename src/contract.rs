//! # contract: the seams between ingestion adapters and the pipeline
//!
//! An ingestion adapter turns raw source messages (broker records, pub/sub
//! messages, files) into [`WorkUnit`]s. Each unit carries a metadata map and an
//! opaque [`ByteHandle`] holding its payload. The pipeline reports back through
//! [`CompletionNotifier`] once a unit has fully concluded.
//!
//! ## Mocking & Testing
//! - [`ByteHandle`] is annotated for `mockall`, so tests can make individual
//!   payload writes fail without touching a real backend.

use std::collections::HashMap;
use std::fmt;
use std::io;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{BoxError, Result};

/// Work unit metadata. Keys are namespaced by adapter name (`ConsumeKafka.Topic`).
pub type Metadata = HashMap<String, serde_json::Value>;

/// Opaque identifier linking a deferred work unit to its pending acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(Uuid);

impl CorrelationToken {
    pub fn new() -> Self {
        CorrelationToken(Uuid::new_v4())
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-unit payload storage: a write-once output stream and a read-once input stream.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ByteHandle: Send + Sync {
    /// Opens a fresh output stream. Previous contents are replaced.
    async fn writer(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Opens an input stream over the current contents.
    async fn reader(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Replaces the contents with `data`.
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer().await?;
        writer.write_all(data).await?;
        writer.shutdown().await
    }
}

/// Supplies a fresh [`ByteHandle`] for every work unit an adapter emits.
pub trait HandleFactory: Send + Sync {
    fn produce(&self) -> Box<dyn ByteHandle>;
}

impl<F> HandleFactory for F
where
    F: Fn() -> Box<dyn ByteHandle> + Send + Sync,
{
    fn produce(&self) -> Box<dyn ByteHandle> {
        self()
    }
}

/// One message or file handed to the pipeline.
pub struct WorkUnit {
    pub metadata: Metadata,
    /// Present only when acknowledgment is deferred until a completion notice.
    pub token: Option<CorrelationToken>,
    pub handle: Box<dyn ByteHandle>,
}

impl WorkUnit {
    pub fn new(metadata: Metadata, handle: Box<dyn ByteHandle>) -> Self {
        Self {
            metadata,
            token: None,
            handle,
        }
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("metadata", &self.metadata)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// How an external scheduler should drive an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    /// Blocks on the source; invoke again as soon as a batch returns.
    EventDriven,
    /// Polls; invoke on a timer.
    CronDriven,
}

/// The pipeline's report that a work unit finished (or is still in flight).
#[derive(Debug)]
pub struct CompletionNotice {
    pub token: Option<CorrelationToken>,
    pub finished: bool,
    pub error: Option<BoxError>,
}

impl CompletionNotice {
    pub fn succeeded(token: CorrelationToken) -> Self {
        Self {
            token: Some(token),
            finished: true,
            error: None,
        }
    }

    pub fn failed(token: CorrelationToken, error: impl Into<BoxError>) -> Self {
        Self {
            token: Some(token),
            finished: true,
            error: Some(error.into()),
        }
    }

    pub fn in_flight(token: CorrelationToken) -> Self {
        Self {
            token: Some(token),
            finished: false,
            error: None,
        }
    }
}

/// Callback by which the pipeline reports per-unit success or failure.
pub trait CompletionNotifier: Send + Sync {
    fn notify_completion(&self, notice: CompletionNotice);
}

/// Common contract of every ingestion adapter: produce one batch of work units.
#[async_trait]
pub trait TriggerAdapter: CompletionNotifier {
    fn name(&self) -> &'static str;

    fn schedule_type(&self) -> ScheduleType;

    /// Produces one batch of work units, writing each payload into a handle from `factory`.
    async fn execute(&self, factory: &dyn HandleFactory) -> Result<Vec<WorkUnit>>;

    /// Cancels any in-progress `execute` and releases the source client.
    async fn close(&self) -> Result<()>;
}
