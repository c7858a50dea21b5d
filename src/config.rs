//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::jobs::BackoffStrategy;
use crate::telemetry::LoggingConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Background job service configuration
    #[serde(default)]
    pub jobs: JobServiceConfig,

    /// Notification service configuration
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the background job service.
#[derive(Debug, Clone, Deserialize)]
pub struct JobServiceConfig {
    /// Maximum number of jobs processing simultaneously
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// How often the dispatch loop polls for eligible jobs
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How often the cleanup sweep runs
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// How long terminal jobs are retained before the sweep purges them
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Backoff strategy applied between retry attempts
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Queue depth above which stats report `warning`
    #[serde(default = "default_queue_depth_warning")]
    pub queue_depth_warning: u64,

    /// Queue depth above which stats report `critical`
    #[serde(default = "default_queue_depth_critical")]
    pub queue_depth_critical: u64,

    /// Error rate above which stats report `warning`
    #[serde(default = "default_error_rate_warning")]
    pub error_rate_warning: f64,

    /// Error rate above which stats report `critical`
    #[serde(default = "default_error_rate_critical")]
    pub error_rate_critical: f64,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            poll_interval: default_poll_interval(),
            cleanup_interval: default_cleanup_interval(),
            retention: default_retention(),
            backoff: BackoffStrategy::default(),
            queue_depth_warning: default_queue_depth_warning(),
            queue_depth_critical: default_queue_depth_critical(),
            error_rate_warning: default_error_rate_warning(),
            error_rate_critical: default_error_rate_critical(),
        }
    }
}

/// Configuration for the notification service.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Maximum delivery attempts per message before retries are refused
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

// Default value functions
fn default_max_concurrent_jobs() -> usize { 10 }
fn default_poll_interval() -> Duration { Duration::from_secs(5) }
fn default_cleanup_interval() -> Duration { Duration::from_secs(24 * 60 * 60) }
fn default_retention() -> Duration { Duration::from_secs(7 * 24 * 60 * 60) }
fn default_queue_depth_warning() -> u64 { 100 }
fn default_queue_depth_critical() -> u64 { 500 }
fn default_error_rate_warning() -> f64 { 0.05 }
fn default_error_rate_critical() -> f64 { 0.25 }
fn default_max_delivery_attempts() -> u32 { 3 }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("FOREMAN").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FOREMAN").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
