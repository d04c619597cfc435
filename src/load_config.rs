//! `load_config`: reads the YAML config file into typed adapter and processor settings.
//!
//! This module is the only place where untrusted YAML is parsed.
//!
//! # Layout
//! - `adapter`: which ingestion adapter `consume` runs, selected by `type`
//!   (`kafka`, `pubsub`, `read_dir`).
//! - `upload`: the HTTP upload processor used by `upload`.
//! - `publish`: the broker or pub/sub publish processor used by `publish`,
//!   selected by `type` (`kafka`, `pubsub`).
//!
//! # Secrets
//! Pub/sub credentials may be left out of the file and supplied through
//! [`PUBSUB_CREDENTIALS_ENV`] instead; the environment wins when both are set.
//!
//! # Extension Guidance
//! To add a new adapter or processor, add its config struct as a variant of
//! [`AdapterConfig`] or [`PublishConfig`] and construct it in `cli`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::kafka::{ConsumeKafkaConfig, PublishKafkaConfig};
use crate::pubsub::{ConsumePubSubConfig, PublishPubSubConfig};
use crate::read_dir::ReadDirConfig;
use crate::upload::UploadHttpConfig;

/// Environment variable holding pub/sub credentials (service account JSON or
/// access token); overrides the file.
pub const PUBSUB_CREDENTIALS_ENV: &str = "PUBSUB_CREDENTIALS";

/// Which ingestion adapter to run, selected by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterConfig {
    Kafka(ConsumeKafkaConfig),
    Pubsub(ConsumePubSubConfig),
    ReadDir(ReadDirConfig),
}

impl AdapterConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterConfig::Kafka(_) => "kafka",
            AdapterConfig::Pubsub(_) => "pubsub",
            AdapterConfig::ReadDir(_) => "read_dir",
        }
    }
}

/// Which publish processor to run, selected by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishConfig {
    Kafka(PublishKafkaConfig),
    Pubsub(PublishPubSubConfig),
}

impl PublishConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            PublishConfig::Kafka(_) => "kafka",
            PublishConfig::Pubsub(_) => "pubsub",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub adapter: Option<AdapterConfig>,
    #[serde(default)]
    pub upload: Option<UploadHttpConfig>,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

fn inject_pubsub_credentials(credentials: &mut String) {
    match std::env::var(PUBSUB_CREDENTIALS_ENV) {
        Ok(value) => {
            info!("{PUBSUB_CREDENTIALS_ENV} found in env");
            *credentials = value;
        }
        Err(_) if credentials.is_empty() => {
            warn!("{PUBSUB_CREDENTIALS_ENV} not set and no credentials in config file");
        }
        Err(_) => {}
    }
}

/// Loads a YAML config file (secrets may be left out) and injects secrets from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<IngestConfig> {
    let path = path.as_ref();
    info!(config_path = ?path, "Loading configuration from file");

    let content = fs::read_to_string(path).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to read config file");
        e
    })
    .with_context(|| format!("Failed to read config file {path:?}"))?;

    let mut config = parse_config(&content)?;

    if let Some(AdapterConfig::Pubsub(pubsub)) = config.adapter.as_mut() {
        inject_pubsub_credentials(&mut pubsub.credentials);
    }
    if let Some(PublishConfig::Pubsub(pubsub)) = config.publish.as_mut() {
        inject_pubsub_credentials(&mut pubsub.credentials);
    }

    info!(
        adapter = config.adapter.as_ref().map(AdapterConfig::kind).unwrap_or("none"),
        upload = config.upload.is_some(),
        publish = config.publish.as_ref().map(PublishConfig::kind).unwrap_or("none"),
        "Config loaded successfully"
    );
    Ok(config)
}

/// Parses YAML config text without touching the environment.
pub fn parse_config(content: &str) -> Result<IngestConfig> {
    serde_yaml::from_str(content)
        .map_err(|e| {
            error!(error = ?e, "Failed to parse config YAML");
            e
        })
        .context("Failed to parse config YAML")
}
