//! Control-plane configuration
//!
//! Deserializable settings for every component, with defaults that match a
//! small single-instance deployment. Profile loading and inheritance are the
//! embedding service's concern; this module only defines the shape,
//! defaulting and validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::ExecutorConfig;
use crate::limiter::RateLimitConfig;
use crate::metrics::MetricsConfig;

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cache max_size must be at least 1")]
    CacheSizeZero,

    #[error("rate limit for '{0}' must allow at least one request per minute")]
    RateZero(&'static str),

    #[error("rate limit burst for '{0}' must be at least 1")]
    BurstZero(&'static str),

    #[error("executor io_workers must be at least 1")]
    NoIoWorkers,

    #[error("execution timeout must be non-zero")]
    TimeoutZero,
}

/// Top-level control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneConfig {
    #[serde(default)]
    pub cache: CacheSettings,

    /// Strict limits for expensive analysis requests
    #[serde(default)]
    pub analysis_limit: LimitSettings,

    /// Lenient limits for cheap management requests
    #[serde(default = "LimitSettings::management_default")]
    pub management_limit: LimitSettings,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            analysis_limit: LimitSettings::default(),
            management_limit: LimitSettings::management_default(),
            executor: ExecutorSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl PlaneConfig {
    /// Check every section for nonsense values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_size == 0 {
            return Err(ConfigError::CacheSizeZero);
        }
        for (name, limit) in [
            ("analysis", &self.analysis_limit),
            ("management", &self.management_limit),
        ] {
            if limit.requests_per_minute <= 0.0 {
                return Err(ConfigError::RateZero(name));
            }
            if limit.burst < 1.0 {
                return Err(ConfigError::BurstZero(name));
            }
        }
        if self.executor.io_workers == 0 {
            return Err(ConfigError::NoIoWorkers);
        }
        if self.executor.timeout_secs == 0 {
            return Err(ConfigError::TimeoutZero);
        }
        Ok(())
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_size")]
    pub max_size: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
            default_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Rate limit settings for one traffic class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_analysis_rpm")]
    pub requests_per_minute: f64,

    #[serde(default = "default_analysis_burst")]
    pub burst: f64,

    #[serde(default = "default_limit_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

impl LimitSettings {
    /// Lenient defaults for the management class
    fn management_default() -> Self {
        Self {
            requests_per_minute: 60.0,
            burst: 20.0,
            cleanup_interval_secs: default_limit_cleanup_secs(),
        }
    }

    pub fn to_limiter_config(&self) -> RateLimitConfig {
        RateLimitConfig::per_minute(self.requests_per_minute, self.burst)
            .with_cleanup_interval(Duration::from_secs(self.cleanup_interval_secs))
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: default_analysis_rpm(),
            burst: default_analysis_burst(),
            cleanup_interval_secs: default_limit_cleanup_secs(),
        }
    }
}

/// Executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,

    /// Defaults to half of available parallelism
    #[serde(default = "ExecutorConfig::default_cpu_workers")]
    pub cpu_workers: usize,

    #[serde(default = "default_true")]
    pub enable_cpu_pool: bool,

    /// Per-call execution timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ExecutorSettings {
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            io_workers: self.io_workers,
            cpu_workers: self.cpu_workers,
            enable_cpu_pool: self.enable_cpu_pool,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            io_workers: default_io_workers(),
            cpu_workers: ExecutorConfig::default_cpu_workers(),
            enable_cpu_pool: true,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Metrics aggregator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_max_request_metrics")]
    pub max_requests: usize,

    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    #[serde(default = "default_metrics_retention_secs")]
    pub retention_secs: u64,
}

impl MetricsSettings {
    pub fn to_metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            max_requests: self.max_requests,
            max_samples: self.max_samples,
            retention: Duration::from_secs(self.retention_secs),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_request_metrics(),
            max_samples: default_max_samples(),
            retention_secs: default_metrics_retention_secs(),
        }
    }
}

fn default_cache_size() -> usize {
    1000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_analysis_rpm() -> f64 {
    10.0
}

fn default_analysis_burst() -> f64 {
    3.0
}

fn default_limit_cleanup_secs() -> u64 {
    300
}

fn default_io_workers() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_max_request_metrics() -> usize {
    10_000
}

fn default_max_samples() -> usize {
    1_440
}

fn default_metrics_retention_secs() -> u64 {
    24 * 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PlaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.analysis_limit.requests_per_minute, 10.0);
        assert_eq!(config.management_limit.requests_per_minute, 60.0);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let json = r#"{
            "cache": {"max_size": 50},
            "analysis_limit": {"requests_per_minute": 5.0, "burst": 2.0}
        }"#;
        let config: PlaneConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cache.max_size, 50);
        // Unspecified fields fall back to defaults
        assert_eq!(config.cache.default_ttl_secs, 300);
        assert_eq!(config.analysis_limit.burst, 2.0);
        assert_eq!(config.management_limit.burst, 20.0);
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        let mut config = PlaneConfig::default();
        config.cache.max_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::CacheSizeZero)));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut config = PlaneConfig::default();
        config.analysis_limit.requests_per_minute = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RateZero("analysis"))
        ));
    }

    #[test]
    fn test_zero_io_workers_rejected() {
        let mut config = PlaneConfig::default();
        config.executor.io_workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NoIoWorkers)));
    }

    #[test]
    fn test_limiter_config_conversion() {
        let settings = LimitSettings {
            requests_per_minute: 10.0,
            burst: 3.0,
            cleanup_interval_secs: 60,
        };
        let config = settings.to_limiter_config();
        assert_eq!(config.capacity, 3.0);
        assert!((config.refill_rate - 10.0 / 60.0).abs() < 1e-9);
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_cpu_pool_sizing_default() {
        let settings = ExecutorSettings::default();
        assert!(settings.cpu_workers >= 1);
        assert!(settings.enable_cpu_pool);
    }
}
