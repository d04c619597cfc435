//! # streamline-ingest
//!
//! Ingestion adapters that turn external sources into work units, and the
//! processors that send those units on.
//!
//! ## Architecture
//! - [`contract`]: the seams every adapter and the pipeline share: work units,
//!   byte handles, completion notices and [`contract::TriggerAdapter`].
//! - Adapters: [`kafka::ConsumeKafka`] (acks at delivery),
//!   [`pubsub::ConsumePubSub`] (acks on receipt or after the pipeline's
//!   verdict, via [`deferred_ack`]) and [`read_dir::ReadDir`].
//! - Processors: [`upload::UploadHttp`], which can stream its request body
//!   through [`transfer`], plus [`kafka::PublishKafka`] and
//!   [`pubsub::PublishPubSub`].
//! - [`load_config`] and [`cli`] wire these together for the binary.
//!
//! ## Mocking & Testing
//! Client seams (consumer group, producer, pub/sub client, ack handle, byte
//! handle, state store) are `mockall`-annotated and exported with the
//! `test-export-mocks` feature, on by default.

pub mod cli;
pub mod contract;
pub mod deferred_ack;
pub mod error;
pub mod handle;
pub mod kafka;
pub mod load_config;
pub mod pubsub;
pub mod read_dir;
pub mod transfer;
pub mod upload;
