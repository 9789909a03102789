use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::collector::series::Window;
use crate::collector::DEFAULT_CAPACITY;

/// Top-level configuration for a digestscope session.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Page identity used when replaying a producer stream. Default: 1.
    #[serde(default = "default_page_id")]
    pub page_id: u64,

    /// Sample buffering and series geometry.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Live refresh intervals.
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Sample buffering and series geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Ring buffer capacity per sample kind. Default: 300.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Digest duration series. Default: 300 buckets of 100ms.
    #[serde(default = "default_digest_timing_series")]
    pub digest_timing: SeriesConfig,

    /// Digest rate series. Default: 300 buckets of 1s.
    #[serde(default = "default_digest_rate_series")]
    pub digest_rate: SeriesConfig,
}

/// Geometry of one windowed series.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SeriesConfig {
    /// Number of buckets.
    pub buckets: usize,

    /// Width of each bucket.
    #[serde(with = "humantime_serde")]
    pub bucket_width: Duration,
}

impl SeriesConfig {
    pub fn window(&self) -> Window {
        Window::new(self.buckets, self.bucket_width.as_millis() as u64)
    }
}

/// Live refresh intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// How often windowed series are re-derived while live. Default: 1s.
    #[serde(default = "default_series_interval", with = "humantime_serde")]
    pub series_interval: Duration,

    /// How often instant metrics (digests in the last second) refresh.
    /// Default: 300ms.
    #[serde(default = "default_instant_interval", with = "humantime_serde")]
    pub instant_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable the health server. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_page_id() -> u64 {
    1
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_digest_timing_series() -> SeriesConfig {
    SeriesConfig {
        buckets: 300,
        bucket_width: Duration::from_millis(100),
    }
}

fn default_digest_rate_series() -> SeriesConfig {
    SeriesConfig {
        buckets: 300,
        bucket_width: Duration::from_secs(1),
    }
}

fn default_series_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_instant_interval() -> Duration {
    Duration::from_millis(300)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            page_id: default_page_id(),
            collector: CollectorConfig::default(),
            refresh: RefreshConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            digest_timing: default_digest_timing_series(),
            digest_rate: default_digest_rate_series(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            series_interval: default_series_interval(),
            instant_interval: default_instant_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.collector.capacity == 0 {
            bail!("collector.capacity must be positive");
        }

        for (name, series) in [
            ("digest_timing", &self.collector.digest_timing),
            ("digest_rate", &self.collector.digest_rate),
        ] {
            if series.buckets == 0 {
                bail!("collector.{name}.buckets must be positive");
            }
            if series.bucket_width.as_millis() == 0 {
                bail!("collector.{name}.bucket_width must be at least 1ms");
            }
        }

        if self.refresh.series_interval.is_zero() {
            bail!("refresh.series_interval must be positive");
        }

        if self.refresh.instant_interval.is_zero() {
            bail!("refresh.instant_interval must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        Ok(())
    }
}
