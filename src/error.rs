//! Error types shared by every adapter, the transfer pipe and the upload processor.

use thiserror::Error;

/// Boxed error used at client seams (broker, subscription, handle backends).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Missing or invalid option; fails adapter setup before consumption begins.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid protocol version: {0}")]
    InvalidVersion(String),

    #[error("topic {0} does not exist and create_topic is false")]
    TopicMissing(String),

    /// Broker claim loop or subscription receive failure; aborts the whole batch.
    #[error("{source_name} session failed: {source}")]
    Session {
        source_name: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template error: {0}")]
    Template(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("received non-2xx response: {status}")]
    UnexpectedStatus { status: reqwest::StatusCode, body: String },

    #[error("client error: {0}")]
    Client(#[source] BoxError),
}

impl IngestError {
    pub fn session(source_name: &'static str, source: impl Into<BoxError>) -> Self {
        IngestError::Session {
            source_name,
            source: source.into(),
        }
    }
}
