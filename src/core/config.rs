use crate::core::errors::{ParallelError, Result};
use crate::pool::Codec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound on units per pool when nothing else is configured
pub const DEFAULT_MAX_WORKERS: usize = 6;

/// Per-pool tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of execution units, fixed for the pool's lifetime
    pub worker_count: usize,
    /// Payloads per flush; 1 sends every payload on its own
    pub batch_size: usize,
    /// Longest a partially filled batch waits before it is flushed
    pub flush_interval_ms: u64,
    /// Wire format across the unit boundary
    pub codec: Codec,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().clamp(1, DEFAULT_MAX_WORKERS),
            batch_size: 1,
            flush_interval_ms: 10,
            codec: Codec::Json,
        }
    }
}

impl PoolSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Millisecond resolution; any remainder rounds up so a non-zero
    /// interval never becomes 0
    pub fn set_flush_interval(&mut self, interval: Duration) {
        self.flush_interval_ms =
            u64::try_from(interval.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX);
    }

    pub fn is_batched(&self) -> bool {
        self.batch_size > 1
    }

    /// Validate against the registry-wide worker cap
    pub fn validate(&self, max_workers: usize) -> Result<()> {
        if self.worker_count == 0 {
            return Err(ParallelError::configuration_field(
                "worker_count must be greater than 0",
                "worker_count",
            ));
        }
        if self.worker_count > max_workers {
            return Err(ParallelError::configuration_field(
                format!(
                    "worker_count {} exceeds max_workers {}",
                    self.worker_count, max_workers
                ),
                "worker_count",
            ));
        }
        if self.batch_size == 0 {
            return Err(ParallelError::configuration_field(
                "batch_size must be greater than 0",
                "batch_size",
            ));
        }
        if self.is_batched() && self.flush_interval_ms == 0 {
            return Err(ParallelError::configuration_field(
                "flush_interval_ms must be greater than 0 when batching",
                "flush_interval_ms",
            ));
        }
        Ok(())
    }
}

/// Registry-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum units any single pool may spawn
    pub max_workers: usize,
    /// Settings handed to pools built through the registry
    pub defaults: PoolSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            defaults: PoolSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ParallelError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }
        self.defaults.validate(self.max_workers)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|ext| ext.to_str());
        if !matches!(extension, Some("json" | "yaml" | "yml")) {
            return Err(ParallelError::configuration(format!(
                "unsupported config file {}, expected .yaml, .yml or .json",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ParallelError::io(format!("read {}", path.display()), e))?;
        match extension {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    /// Small pools, immediate flushes
    pub fn development() -> Self {
        Self {
            max_workers: 2,
            defaults: PoolSettings {
                worker_count: 2,
                batch_size: 1,
                ..Default::default()
            },
        }
    }

    /// Scale with CPU count and batch aggressively
    pub fn high_throughput() -> Self {
        let cpu_count = num_cpus::get().max(1);

        Self {
            max_workers: cpu_count * 2,
            defaults: PoolSettings {
                worker_count: cpu_count,
                batch_size: 64,
                flush_interval_ms: 5,
                codec: Codec::Bincode,
            },
        }
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.config.defaults.worker_count = worker_count;
        self
    }

    /// Set batch size and flush interval together
    pub fn batching(mut self, batch_size: usize, flush_interval: Duration) -> Self {
        self.config.defaults.batch_size = batch_size;
        self.config.defaults.set_flush_interval(flush_interval);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.config.defaults.codec = codec;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
