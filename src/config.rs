//! TOML configuration parsing and validation.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/docpipe.sqlite"
//!
//! [object_store]
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO / LocalStack
//!
//! [model]
//! model_id = "anthropic.claude-3-sonnet-20240229-v1:0"
//! region = "us-east-1"
//!
//! [limits]
//! vision_max_bytes = 20971520
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//!
//! [pipeline]
//! deadline_secs = 300
//! ```
//!
//! Only `[db]` and `[model].model_id` are required; every other value has a
//! default.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Per-write timeout of the result store.
    #[serde(default = "default_db_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            timeout_secs: default_store_timeout_secs(),
        }
    }
}

/// Generative model settings shared by the vision extractor and the summarizer.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_id: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_extraction_max_tokens")]
    pub extraction_max_tokens: u32,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    #[serde(default = "default_extraction_temperature")]
    pub extraction_temperature: f32,
    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Largest payload (raw bytes) sent to the model in one vision call.
    #[serde(default = "default_vision_max_bytes")]
    pub vision_max_bytes: usize,
    #[serde(default = "default_max_vision_chunks")]
    pub max_vision_chunks: usize,
    /// Character budget of the excerpt handed to the summarizer.
    #[serde(default = "default_summary_excerpt_chars")]
    pub summary_excerpt_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            vision_max_bytes: default_vision_max_bytes(),
            max_vision_chunks: default_max_vision_chunks(),
            summary_excerpt_chars: default_summary_excerpt_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Wall-clock budget of a single invocation, across all steps and retries.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_db_timeout_secs() -> u64 {
    10
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_store_timeout_secs() -> u64 {
    30
}
fn default_model_timeout_secs() -> u64 {
    120
}
fn default_extraction_max_tokens() -> u32 {
    8000
}
fn default_summary_max_tokens() -> u32 {
    1000
}
fn default_extraction_temperature() -> f32 {
    0.1
}
fn default_summary_temperature() -> f32 {
    0.3
}
fn default_top_p() -> f32 {
    0.9
}
fn default_vision_max_bytes() -> usize {
    20 * 1024 * 1024
}
fn default_max_vision_chunks() -> usize {
    16
}
fn default_summary_excerpt_chars() -> usize {
    8000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_deadline_secs() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    8
}

impl DbConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ObjectStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.model.model_id.trim().is_empty() {
        bail!("model.model_id must not be empty");
    }

    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
    }

    if config.limits.vision_max_bytes == 0 {
        bail!("limits.vision_max_bytes must be > 0");
    }
    if config.limits.max_vision_chunks == 0 {
        bail!("limits.max_vision_chunks must be >= 1");
    }
    if config.limits.summary_excerpt_chars < 2 {
        bail!("limits.summary_excerpt_chars must be >= 2");
    }

    if config.pipeline.deadline_secs == 0 {
        bail!("pipeline.deadline_secs must be > 0");
    }
    if config.pipeline.max_concurrent == 0 {
        bail!("pipeline.max_concurrent must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.model.top_p) {
        bail!("model.top_p must be in [0.0, 1.0]");
    }

    Ok(())
}
