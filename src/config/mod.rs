//! # Configuration Management Module
//!
//! One TOML file drives the collector, the maintenance jobs and logging. Every section has
//! defaults, so a minimal file (or none at all via `meshcollectd init`) is enough to start.
//!
//! ## Configuration Structure
//!
//! - [`CollectorConfig`] - channel keys, physical sender policy, node-count topic segment
//! - [`StorageConfig`] - where the raw and distilled sled databases live
//! - [`DistillConfig`] - rollup schedule and bootstrap window
//! - [`RetentionConfig`] - raw row pruning
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshcollectd::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("raw db at {}", config.storage.raw_db_path().display());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [collector]
//! default_channel_key = "AQ=="
//! physical_sender = "sender"     # or "gateway"
//! node_count_segment = "nodes_count"
//!
//! [collector.channel_keys]
//! LongFast = "AQ=="
//!
//! [storage]
//! data_dir = "./data"
//!
//! [distill]
//! enabled = true
//! interval_minutes = 60
//! hours_back = 2
//!
//! [retention]
//! enabled = true
//! days = 7
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

use crate::distill::{DistillOptions, DEFAULT_HOURS_BACK, DEFAULT_VALIDITY_FLOOR};
use crate::meshtastic::crypto::{ChannelKey, DEFAULT_CHANNEL_KEY};
use crate::meshtastic::decoder::DEFAULT_NODE_COUNT_SEGMENT;
pub use crate::meshtastic::decoder::PhysicalSenderPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub distill: DistillConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Base64 PSK used when a channel has no entry in `channel_keys`.
    #[serde(default = "default_channel_key")]
    pub default_channel_key: String,
    #[serde(default)]
    pub physical_sender: PhysicalSenderPolicy,
    /// Topic segment that marks node-count reports (`.../<segment>/<hex id>`).
    #[serde(default = "default_node_count_segment")]
    pub node_count_segment: String,
    /// Channel id (as seen in `ServiceEnvelope.channel_id`) to base64 PSK.
    #[serde(default = "default_channel_keys")]
    pub channel_keys: HashMap<String, String>,
}

fn default_channel_key() -> String {
    DEFAULT_CHANNEL_KEY.to_string()
}

fn default_node_count_segment() -> String {
    DEFAULT_NODE_COUNT_SEGMENT.to_string()
}

fn default_channel_keys() -> HashMap<String, String> {
    let mut channel_keys = HashMap::new();
    channel_keys.insert("LongFast".to_string(), DEFAULT_CHANNEL_KEY.to_string());
    channel_keys
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            default_channel_key: default_channel_key(),
            physical_sender: PhysicalSenderPolicy::Sender,
            node_count_segment: default_node_count_segment(),
            channel_keys: default_channel_keys(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn raw_db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("messages")
    }

    pub fn distilled_db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("distilled")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Hours re-processed on each scheduled run to catch late arrivals.
    #[serde(default = "default_hours_back")]
    pub hours_back: u32,
    /// Events stamped before this unix time are ignored.
    #[serde(default = "default_validity_floor")]
    pub validity_floor: i64,
}

fn default_true() -> bool {
    true
}
fn default_interval_minutes() -> u64 {
    60
}
fn default_hours_back() -> u32 {
    DEFAULT_HOURS_BACK
}
fn default_validity_floor() -> i64 {
    DEFAULT_VALIDITY_FLOOR
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_interval_minutes(),
            hours_back: default_hours_back(),
            validity_floor: default_validity_floor(),
        }
    }
}

impl DistillConfig {
    pub fn options(&self) -> DistillOptions {
        DistillOptions {
            hours_back: self.hours_back,
            validity_floor: self.validity_floor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub days: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
}

fn default_retention_days() -> u32 {
    7
}
fn default_batch_size() -> usize {
    10_000
}
fn default_interval_hours() -> u64 {
    24
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: default_retention_days(),
            batch_size: default_batch_size(),
            interval_hours: default_interval_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("meshcollectd.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject settings the collector cannot run with. Keys are decoded here so a typo in a
    /// PSK stops startup instead of silently producing undecryptable packets.
    pub fn validate(&self) -> Result<()> {
        ChannelKey::from_base64(&self.collector.default_channel_key)
            .map_err(|e| anyhow!("collector.default_channel_key: {}", e))?;
        for (channel, key) in &self.collector.channel_keys {
            ChannelKey::from_base64(key)
                .map_err(|e| anyhow!("collector.channel_keys.{}: {}", channel, e))?;
        }
        if self.collector.node_count_segment.is_empty()
            || self.collector.node_count_segment.contains('/')
        {
            bail!("collector.node_count_segment must be a single non-empty topic segment");
        }
        if self.storage.data_dir.trim().is_empty() {
            bail!("storage.data_dir must not be empty");
        }
        if self.distill.interval_minutes == 0 {
            bail!("distill.interval_minutes must be greater than 0");
        }
        if self.distill.hours_back == 0 {
            bail!("distill.hours_back must be greater than 0");
        }
        if self.retention.days == 0 {
            bail!("retention.days must be greater than 0");
        }
        if self.retention.batch_size == 0 {
            bail!("retention.batch_size must be greater than 0");
        }
        if self.retention.interval_hours == 0 {
            bail!("retention.interval_hours must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.collector.default_channel_key, "AQ==");
        assert_eq!(config.distill.hours_back, 2);
        assert_eq!(config.retention.days, 7);
        assert_eq!(config.retention.batch_size, 10_000);
        assert_eq!(
            config.storage.raw_db_path(),
            PathBuf::from("./data").join("messages")
        );
    }

    #[test]
    fn minimal_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [collector]
            physical_sender = "gateway"
            [collector.channel_keys]
            Secret = "c2VjcmV0LWtleQ=="
            [retention]
            days = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.collector.physical_sender, PhysicalSenderPolicy::Gateway);
        assert_eq!(config.collector.default_channel_key, "AQ==");
        assert_eq!(config.collector.node_count_segment, "nodes_count");
        assert_eq!(config.retention.days, 30);
        assert_eq!(config.retention.batch_size, 10_000);
        assert!(config.distill.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_keys_and_zero_values() {
        let mut config = Config::default();
        config
            .collector
            .channel_keys
            .insert("Broken".into(), "***".into());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Broken"), "{}", err);

        let mut config = Config::default();
        config.collector.default_channel_key = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        // 33 bytes
        config.collector.default_channel_key =
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retention.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn omitted_sections_match_default() {
        let from_file: Config = toml::from_str("[collector]\nphysical_sender = \"sender\"\n").unwrap();
        let built = Config::default();
        assert_eq!(from_file.collector.channel_keys, built.collector.channel_keys);
        assert_eq!(
            from_file.collector.channel_keys.get("LongFast").map(String::as_str),
            Some("AQ==")
        );
        let empty: Config = toml::from_str("").unwrap();
        assert_eq!(empty.collector.channel_keys, built.collector.channel_keys);
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.collector.channel_keys, config.collector.channel_keys);
        assert_eq!(back.logging.file.as_deref(), Some("meshcollectd.log"));
    }

    #[tokio::test]
    async fn create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let config = Config::load(path).await.unwrap();
        assert_eq!(config.distill.interval_minutes, 60);
        assert!(Config::load("/nonexistent/meshcollectd.toml").await.is_err());
    }
}
