use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub storage: StorageConfig,
    pub compression: CompressionConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub poller: PollerConfig,
}

/// When the capacity evictor runs relative to a version write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionMode {
    /// Detached thread after the write commits.
    #[default]
    Background,
    /// On the calling thread, right after the write commits.
    Inline,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_versions: usize,
    pub quota_bytes: u64,
    pub warning_fraction: f64,
    pub busy_timeout_ms: u64,
    pub eviction: EvictionMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_versions: 50,
            quota_bytes: 50 * 1024 * 1024,
            warning_fraction: 0.8,
            busy_timeout_ms: 5_000,
            eviction: EvictionMode::Background,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub threshold_bytes: usize,
    pub max_dimension: u32,
    pub quality: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 100 * 1024,
            max_dimension: 1024,
            quality: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_ms: i64,
    pub cooldown_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_ms: 60_000,
            cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_topics: usize,
    pub save_to_history: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_topics: 50,
            save_to_history: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub short_interval_ms: u64,
    pub short_polls: u32,
    pub medium_interval_ms: u64,
    pub medium_polls: u32,
    pub long_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            short_interval_ms: 5_000,
            short_polls: 5,
            medium_interval_ms: 10_000,
            medium_polls: 5,
            long_interval_ms: 30_000,
        }
    }
}

impl PollerConfig {
    pub fn short_interval(&self) -> Duration {
        Duration::from_millis(self.short_interval_ms)
    }

    pub fn medium_interval(&self) -> Duration {
        Duration::from_millis(self.medium_interval_ms)
    }

    pub fn long_interval(&self) -> Duration {
        Duration::from_millis(self.long_interval_ms)
    }
}

impl CoreConfig {
    /// Loads configuration from a JSON file; a missing path yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) if path.exists() => {
                let raw = fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_slice::<Self>(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.max_versions == 0 {
            bail!("storage.max_versions must be greater than zero");
        }
        if self.storage.quota_bytes == 0 {
            bail!("storage.quota_bytes must be greater than zero");
        }
        if !(self.storage.warning_fraction > 0.0 && self.storage.warning_fraction <= 1.0) {
            bail!(
                "storage.warning_fraction out of range: {} (expected 0 < f <= 1)",
                self.storage.warning_fraction
            );
        }
        if self.compression.max_dimension == 0 {
            bail!("compression.max_dimension must be greater than zero");
        }
        if !(self.compression.quality > 0.0 && self.compression.quality <= 1.0) {
            bail!(
                "compression.quality out of range: {} (expected 0 < q <= 1)",
                self.compression.quality
            );
        }
        if self.rate_limit.max_requests == 0 {
            bail!("rate_limit.max_requests must be greater than zero");
        }
        if self.rate_limit.window_ms <= 0 || self.rate_limit.cooldown_ms < 0 {
            bail!("rate_limit.window_ms must be positive and cooldown_ms non-negative");
        }
        if self.batch.max_topics == 0 {
            bail!("batch.max_topics must be greater than zero");
        }
        if self.poller.short_interval_ms == 0
            || self.poller.medium_interval_ms == 0
            || self.poller.long_interval_ms == 0
        {
            bail!("poller intervals must be greater than zero");
        }
        Ok(())
    }
}
