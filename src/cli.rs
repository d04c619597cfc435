//! Command-line interface for streamline-ingest: argument parsing and the
//! glue between config, adapters and processors.
//!
//! Business logic lives in the adapter and processor modules; this module only
//! builds them from a loaded config and drives them.
//!
//! ## Subcommands
//! - `consume`: runs the configured adapter and writes every work unit to an
//!   output directory as `<id>.bin` plus a `<id>.json` metadata sidecar. Units
//!   carrying a correlation token are reported back to the adapter once their
//!   files are written, so deferred pub/sub acks follow the write outcome.
//!   Ctrl-C closes the adapter.
//! - `upload`: sends one local file through the HTTP upload processor and
//!   prints the resulting metadata.
//! - `publish`: sends one local file through the configured Kafka or pub/sub
//!   publish processor and prints the resulting metadata.
//!
//! ## How To Use
//! - From the shell: `streamline-ingest --help`.
//! - Programmatically or from integration tests: call [`run`] with a parsed [`Cli`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::contract::{
    ByteHandle, CompletionNotice, Metadata, ScheduleType, TriggerAdapter, WorkUnit,
};
use crate::handle::{MemoryHandle, TempFileHandleFactory};
use crate::kafka::{ConsumeKafkaConfig, PublishKafkaConfig};
use crate::load_config::{load_config, AdapterConfig, PublishConfig};
use crate::pubsub::{ConsumePubSub, PublishPubSub};
use crate::read_dir::{MemoryStateStore, ReadDir};
use crate::upload::UploadHttp;

/// CLI for streamline-ingest: run an ingestion adapter or upload a file.
#[derive(Parser)]
#[clap(
    name = "streamline-ingest",
    version,
    about = "Ingest broker, pub/sub and directory sources into work units, and upload payloads over HTTP"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the configured adapter, writing each work unit to the output directory
    Consume {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Directory receiving `<id>.bin` payloads and `<id>.json` metadata
        #[clap(long)]
        output_dir: PathBuf,
        /// Stop after the first batch
        #[clap(long)]
        once: bool,
        /// Seconds between runs of a polling adapter
        #[clap(long, default_value_t = 5)]
        interval_secs: u64,
    },
    /// Upload one local file with the configured HTTP upload processor
    Upload {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// File to upload
        #[clap(long)]
        file: PathBuf,
    },
    /// Publish one local file with the configured Kafka or pub/sub processor
    Publish {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// File whose contents become the message
        #[clap(long)]
        file: PathBuf,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Consume {
            config,
            output_dir,
            once,
            interval_secs,
        } => consume(&config, &output_dir, once, Duration::from_secs(interval_secs)).await,
        Commands::Upload { config, file } => upload(&config, &file).await,
        Commands::Publish { config, file } => publish(&config, &file).await,
    }
}

#[cfg(feature = "kafka")]
fn kafka_adapter(config: &ConsumeKafkaConfig) -> Result<Arc<dyn TriggerAdapter>> {
    Ok(Arc::new(crate::kafka::ConsumeKafka::connect(config)?))
}

#[cfg(not(feature = "kafka"))]
fn kafka_adapter(config: &ConsumeKafkaConfig) -> Result<Arc<dyn TriggerAdapter>> {
    config.validate()?;
    bail!("kafka adapter requires building with the `kafka` feature")
}

#[cfg(feature = "kafka")]
fn kafka_publisher(config: &PublishKafkaConfig) -> Result<crate::kafka::PublishKafka> {
    Ok(crate::kafka::PublishKafka::connect(config)?)
}

#[cfg(not(feature = "kafka"))]
fn kafka_publisher(config: &PublishKafkaConfig) -> Result<crate::kafka::PublishKafka> {
    config.validate()?;
    bail!("kafka publisher requires building with the `kafka` feature")
}

async fn build_adapter(config: AdapterConfig) -> Result<Arc<dyn TriggerAdapter>> {
    Ok(match config {
        AdapterConfig::Kafka(kafka) => kafka_adapter(&kafka)?,
        AdapterConfig::Pubsub(pubsub) => Arc::new(ConsumePubSub::connect_rest(pubsub).await?),
        AdapterConfig::ReadDir(read_dir) => {
            Arc::new(ReadDir::new(read_dir, Box::new(MemoryStateStore::new()))?)
        }
    })
}

async fn consume(config: &Path, output_dir: &Path, once: bool, interval: Duration) -> Result<()> {
    let config = load_config(config)?;
    let Some(adapter_config) = config.adapter else {
        bail!("config has no `adapter` section");
    };
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create output directory {output_dir:?}"))?;

    let adapter = build_adapter(adapter_config).await?;
    let factory = TempFileHandleFactory::new(std::env::temp_dir());
    let shutdown = CancellationToken::new();

    let interrupt = {
        let adapter = Arc::clone(&adapter);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, closing adapter");
                shutdown.cancel();
                if let Err(e) = adapter.close().await {
                    warn!(error = %e, "Failed to close adapter");
                }
            }
        })
    };

    info!(adapter = adapter.name(), output_dir = %output_dir.display(), "Consume starting");
    let mut total = 0usize;
    let outcome = loop {
        let units = match adapter.execute(&factory).await {
            Ok(units) => units,
            Err(e) => break Err(anyhow::Error::new(e).context("adapter execution failed")),
        };
        for unit in units {
            deliver(adapter.as_ref(), output_dir, unit).await;
            total += 1;
        }
        if once || shutdown.is_cancelled() {
            break Ok(());
        }
        if adapter.schedule_type() == ScheduleType::CronDriven {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    };

    if !shutdown.is_cancelled() {
        interrupt.abort();
        adapter.close().await?;
    }
    info!(units = total, "Consume finished");
    println!("Consumed {total} work units into {}", output_dir.display());
    outcome
}

/// Writes one unit to the output directory and reports the result back to the adapter.
async fn deliver(adapter: &dyn TriggerAdapter, output_dir: &Path, unit: WorkUnit) {
    let id = Uuid::new_v4().simple().to_string();
    let result = write_unit(output_dir, &id, &unit).await;
    if let Err(e) = &result {
        error!(error = %e, unit = %id, "Failed to write work unit");
    }
    if let Some(token) = unit.token {
        let notice = match result {
            Ok(()) => CompletionNotice::succeeded(token),
            Err(e) => CompletionNotice::failed(token, e),
        };
        adapter.notify_completion(notice);
    }
}

async fn write_unit(output_dir: &Path, id: &str, unit: &WorkUnit) -> std::io::Result<()> {
    let mut payload = tokio::fs::File::create(output_dir.join(format!("{id}.bin"))).await?;
    let mut source = unit.handle.reader().await?;
    tokio::io::copy(&mut source, &mut payload).await?;
    payload.flush().await?;
    let metadata = serde_json::to_vec_pretty(&unit.metadata)?;
    tokio::fs::write(output_dir.join(format!("{id}.json")), metadata).await
}

async fn file_handle(file: &Path) -> Result<MemoryHandle> {
    let contents = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {file:?}"))?;
    let handle = MemoryHandle::new();
    handle.write(&contents).await?;
    Ok(handle)
}

async fn upload(config: &Path, file: &Path) -> Result<()> {
    let config = load_config(config)?;
    let Some(upload_config) = config.upload else {
        bail!("config has no `upload` section");
    };
    let processor = UploadHttp::new(upload_config)?;
    let handle = file_handle(file).await?;

    let mut metadata = Metadata::new();
    processor.execute(&mut metadata, &handle).await?;
    info!(file = %file.display(), "Upload complete");
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

async fn publish(config: &Path, file: &Path) -> Result<()> {
    let config = load_config(config)?;
    let Some(publish_config) = config.publish else {
        bail!("config has no `publish` section");
    };
    let handle = file_handle(file).await?;
    let mut metadata = Metadata::new();

    match publish_config {
        PublishConfig::Kafka(kafka) => {
            let processor = kafka_publisher(&kafka)?;
            processor.execute(&mut metadata, &handle).await?;
            processor.close().await?;
        }
        PublishConfig::Pubsub(pubsub) => {
            let processor = PublishPubSub::connect_rest(pubsub).await?;
            processor.execute(&mut metadata, &handle).await?;
            processor.close().await?;
        }
    }
    info!(file = %file.display(), "Publish complete");
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}
