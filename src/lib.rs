//! # meshcollectd - Meshtastic MQTT collector
//!
//! meshcollectd ingests the messages Meshtastic gateways publish over MQTT, turns each one
//! into typed records and keeps them in a local sled database. A batch engine rolls the raw
//! rows up into hourly and daily summaries; a retention job keeps the raw store bounded.
//!
//! ## Features
//!
//! - **Two encodings**: JSON gateway messages and protobuf `ServiceEnvelope`s.
//! - **Channel decryption**: AES-256-CTR with per-channel pre-shared keys (default `AQ==`).
//! - **Payload classification**: ordered parser attempts; nothing is lost, unknown payloads
//!   are stored as hex.
//! - **Single-writer persistence**: one blocking worker owns all store writes, in order.
//! - **Distillation**: idempotent hourly/daily counts and unique-sender summaries.
//! - **Retention**: chunked deletion of rows older than the configured window.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshcollectd::collector::Collector;
//! use meshcollectd::config::Config;
//! use meshcollectd::metrics::IngestMetrics;
//! use meshcollectd::storage::SledStore;
//! use meshcollectd::transport::InboundMessage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     let store = SledStore::open(config.storage.raw_db_path())?;
//!     let collector = Collector::new(&config, store, Arc::new(IngestMetrics::default()))?;
//!
//!     let (tx, rx) = tokio::sync::mpsc::channel(1024);
//!     tx.send(InboundMessage::new("msh/EU/2/json/LongFast/!00000001", br#"{"from":1}"#.to_vec()))
//!         .await?;
//!     drop(tx);
//!     collector.run(rx).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`transport`] - inbound message type and the capture-line bridge
//! - [`meshtastic`] - decryption, payload classification and the message decoder
//! - [`collector`] - decode loop and the maintenance scheduler
//! - [`storage`] - sled store, persistence worker and retention
//! - [`distill`] - hourly and daily rollups
//! - [`config`] - configuration loading and validation
//! - [`metrics`] - ingestion counters
//! - [`validation`] - node id parsing and name sanitizing
//! - [`protobuf`] - generated Meshtastic protobuf types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Transport     │ ← (topic, bytes) over an mpsc channel
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Collector     │ ← decode, decrypt, classify
//! └─────────────────┘
//!          │ StoreOp queue
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Storage       │ ──► │   Distill       │ ← scheduled batch jobs
//! │   worker        │     │   Retention     │
//! └─────────────────┘     └─────────────────┘
//! ```

pub mod collector;
pub mod config;
pub mod distill;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
pub mod storage;
pub mod transport;
pub mod validation;
