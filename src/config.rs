//! Stagehand Configuration
//!
//! This module provides configuration structures for the stagehand
//! change-data-capture sink.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main stagehand configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagehandConfig {
    /// Staging database connection configuration
    pub staging: StagingConfig,

    /// Resolver loop configuration
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Lease coordination configuration
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Staging database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagingConfig {
    /// Connection string for the staging database (PostgreSQL wire protocol)
    pub conn: String,

    /// Schema that holds the staging tables and metadata
    #[serde(default = "default_staging_schema")]
    pub schema: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Resolver loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Reader poll interval for checkpoints written by peer replicas,
    /// in milliseconds
    #[serde(default = "default_backup_polling_ms")]
    pub backup_polling_ms: u64,

    /// Upper bound on a single flush cycle, in milliseconds
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Upper bound on a backfill-mode transaction, in milliseconds
    /// (0 = disabled; backfill mode is then never selected)
    #[serde(default)]
    pub backfill_window_ms: u64,

    /// Maximum mutations fetched per staging query
    #[serde(default = "default_select_batch_size")]
    pub select_batch_size: usize,

    /// Soft threshold of buffered mutations that triggers an interim flush
    #[serde(default = "default_ideal_flush_batch_size")]
    pub ideal_flush_batch_size: usize,

    /// Flush on every HLC-epoch change, preserving all intermediate row
    /// states instead of fast-forwarding to the latest consistent state
    #[serde(default)]
    pub flush_every_timestamp: bool,

    /// How long applied mutations are retained in staging before
    /// retirement, in milliseconds
    #[serde(default = "default_retire_offset_ms")]
    pub retire_offset_ms: u64,

    /// Probability of injected failure per loop entry point; property
    /// testing only, leave at 0 in production
    #[serde(default)]
    pub chaos_prob: f32,
}

/// Lease coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease lifetime in milliseconds; renewed at a third of this interval
    #[serde(default = "default_lease_duration_ms")]
    pub duration_ms: u64,

    /// Minimum sleep before re-attempting a busy lease, in milliseconds
    #[serde(default = "default_lease_poll_ms")]
    pub poll_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_staging_schema() -> String {
    "_stagehand".to_string()
}

fn default_pool_size() -> u32 {
    16
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_backup_polling_ms() -> u64 {
    1000
}

fn default_apply_timeout_ms() -> u64 {
    30_000
}

fn default_select_batch_size() -> usize {
    10_000
}

fn default_ideal_flush_batch_size() -> usize {
    1_000
}

fn default_retire_offset_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_lease_duration_ms() -> u64 {
    60_000
}

fn default_lease_poll_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            backup_polling_ms: default_backup_polling_ms(),
            apply_timeout_ms: default_apply_timeout_ms(),
            backfill_window_ms: 0,
            select_batch_size: default_select_batch_size(),
            ideal_flush_batch_size: default_ideal_flush_batch_size(),
            flush_every_timestamp: false,
            retire_offset_ms: default_retire_offset_ms(),
            chaos_prob: 0.0,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_lease_duration_ms(),
            poll_ms: default_lease_poll_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ResolverConfig {
    /// Get the backup poll interval as Duration
    pub fn backup_polling(&self) -> Duration {
        Duration::from_millis(self.backup_polling_ms)
    }

    /// Get the apply timeout as Duration
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    /// Get the backfill window as Duration, or None when disabled
    pub fn backfill_window(&self) -> Option<Duration> {
        if self.backfill_window_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.backfill_window_ms))
        }
    }

    /// Get the retirement retention offset as Duration
    pub fn retire_offset(&self) -> Duration {
        Duration::from_millis(self.retire_offset_ms)
    }

    /// The transaction bound for a flush: the apply timeout, further
    /// narrowed by the backfill window when one is set and shorter.
    pub fn flush_timeout(&self, backfill: bool) -> Duration {
        let apply = self.apply_timeout();
        match self.backfill_window() {
            Some(window) if backfill && window < apply => window,
            _ => apply,
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber described by this
    /// configuration. A subscriber installed earlier (e.g. by an
    /// embedding application or a test harness) wins silently.
    pub fn init(&self) {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.level));
        let registry = tracing_subscriber::registry().with(filter);
        let result = if self.format == "json" {
            registry.with(tracing_subscriber::fmt::layer().json()).try_init()
        } else {
            registry.with(tracing_subscriber::fmt::layer()).try_init()
        };
        if result.is_err() {
            tracing::debug!("logging already initialized");
        }
    }
}

impl LeaseConfig {
    /// Get the lease lifetime as Duration
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Get the renewal interval as Duration
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.duration_ms / 3)
    }

    /// Get the busy-retry floor as Duration
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl StagehandConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: StagehandConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.staging.conn.is_empty() {
            return Err(crate::Error::Config("staging.conn cannot be empty".into()));
        }

        if self.staging.schema.is_empty() {
            return Err(crate::Error::Config("staging.schema cannot be empty".into()));
        }

        if self.resolver.select_batch_size == 0 {
            return Err(crate::Error::Config(
                "resolver.select_batch_size must be positive".into(),
            ));
        }

        if self.resolver.apply_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "resolver.apply_timeout_ms must be positive".into(),
            ));
        }

        if self.lease.duration_ms < 3 {
            return Err(crate::Error::Config(
                "lease.duration_ms is too small to renew".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[staging]
conn = "postgres://stagehand@localhost:26257/defaultdb"
schema = "_stagehand"

[resolver]
backup_polling_ms = 250
ideal_flush_batch_size = 500
flush_every_timestamp = true

[lease]
duration_ms = 30000
"#;

        let config = StagehandConfig::from_str(toml).unwrap();
        assert_eq!(config.staging.pool_size, 16);
        assert_eq!(config.resolver.backup_polling(), Duration::from_millis(250));
        assert_eq!(config.resolver.ideal_flush_batch_size, 500);
        assert!(config.resolver.flush_every_timestamp);
        assert_eq!(config.resolver.select_batch_size, 10_000);
        assert_eq!(config.lease.renewal_interval(), Duration::from_secs(10));
        assert!(config.resolver.backfill_window().is_none());
    }

    #[test]
    fn test_missing_conn_rejected() {
        let err = StagehandConfig::from_str("[staging]\nconn = \"\"\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_logging_init_is_reentrant() {
        let logging = LoggingConfig::default();
        logging.init();
        // A second call must not panic even though a subscriber exists.
        logging.init();
    }

    #[test]
    fn test_flush_timeout_narrowing() {
        let resolver = ResolverConfig {
            apply_timeout_ms: 30_000,
            backfill_window_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(resolver.flush_timeout(false), Duration::from_secs(30));
        assert_eq!(resolver.flush_timeout(true), Duration::from_secs(10));

        let no_window = ResolverConfig::default();
        assert_eq!(no_window.flush_timeout(true), Duration::from_secs(30));
    }
}
