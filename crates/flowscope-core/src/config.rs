//! Core configuration
//!
//! The shell decides where the file lives; the core only parses and
//! validates it. All limits have working defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where a redaction rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionTarget {
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
    All,
}

/// One export-time redaction rule. The pattern is a regular expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionRule {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    pub target: RedactionTarget,
}

/// Threshold limits; 0 disables a rule.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default)]
    pub latency_limit_ms: u64,
    #[serde(default)]
    pub total_limit: u32,
    #[serde(default)]
    pub input_limit: u32,
    #[serde(default)]
    pub output_limit: u32,
}

impl ThresholdConfig {
    pub fn is_enabled(&self) -> bool {
        self.latency_limit_ms > 0
            || self.total_limit > 0
            || self.input_limit > 0
            || self.output_limit > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Terminal flows kept hot in memory.
    pub memory_store_size: usize,
    /// Day folders older than this are reclaimed.
    pub retention_days: u32,
    pub max_request_body_bytes: usize,
    pub max_response_body_bytes: usize,
    /// Keep raw SSE chunks on the Flow. Default off.
    pub persist_raw_chunks: bool,
    /// Fraction of accepted requests that are captured, in [0, 1].
    pub sampling_rate: f64,
    pub excluded_models: Vec<String>,
    pub excluded_paths: Vec<String>,
    pub redaction_rules: Vec<RedactionRule>,
    pub thresholds: ThresholdConfig,
    /// Per-subscriber event ring capacity.
    pub subscriber_capacity: usize,
    /// FileStore write queue capacity; overflow drops the oldest unwritten.
    pub write_queue_capacity: usize,
    /// Shard rotation threshold in bytes.
    pub max_shard_bytes: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            memory_store_size: 1000,
            retention_days: 7,
            max_request_body_bytes: 1024 * 1024,
            max_response_body_bytes: 10 * 1024 * 1024,
            persist_raw_chunks: false,
            sampling_rate: 1.0,
            excluded_models: Vec::new(),
            excluded_paths: Vec::new(),
            redaction_rules: Vec::new(),
            thresholds: ThresholdConfig::default(),
            subscriber_capacity: 1024,
            write_queue_capacity: 1024,
            max_shard_bytes: 64 * 1024 * 1024,
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_store_size == 0 {
            return Err(Error::Config("memory_store_size must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(Error::Config(format!(
                "sampling_rate must be in [0, 1], got {}",
                self.sampling_rate
            )));
        }
        if self.write_queue_capacity == 0 {
            return Err(Error::Config("write_queue_capacity must be > 0".to_string()));
        }
        if self.subscriber_capacity == 0 {
            return Err(Error::Config("subscriber_capacity must be > 0".to_string()));
        }
        if self.max_shard_bytes == 0 {
            return Err(Error::Config("max_shard_bytes must be > 0".to_string()));
        }
        for rule in &self.redaction_rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                Error::Config(format!("redaction rule '{}': {}", rule.name, e))
            })?;
        }
        Ok(())
    }
}
