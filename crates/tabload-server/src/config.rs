//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::config::IngestConfig;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/tabload";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default delay between dequeue polls of an idle worker.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Default age after which finished queue jobs are cleaned (1 day).
pub const DEFAULT_CLEAN_GRACE_SECS: u64 = 86_400;

/// Default period of the background queue clean (1 hour).
pub const DEFAULT_CLEAN_INTERVAL_SECS: u64 = 3_600;

/// Upper bound of jobs removed per clean pass.
pub const DEFAULT_CLEAN_LIMIT: usize = 1_000;

/// Buffered lifecycle events per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

/// Default period between scans for pending job records written by other processes.
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 5;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub ingest: IngestConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub clean_grace_secs: u64,
    pub clean_interval_secs: u64,
    pub clean_limit: usize,
    pub event_capacity: usize,
    pub discovery_interval_secs: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn clean_grace(&self) -> Duration {
        Duration::from_secs(self.clean_grace_secs)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            clean_grace_secs: DEFAULT_CLEAN_GRACE_SECS,
            clean_interval_secs: DEFAULT_CLEAN_INTERVAL_SECS,
            clean_limit: DEFAULT_CLEAN_LIMIT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            discovery_interval_secs: DEFAULT_DISCOVERY_INTERVAL_SECS,
        }
    }
}

/// Read `name` from the environment, falling back to `default` when unset or unparsable
pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            queue: QueueConfig {
                poll_interval_ms: env_or("INGEST_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
                clean_grace_secs: env_or("QUEUE_CLEAN_GRACE_SECS", DEFAULT_CLEAN_GRACE_SECS),
                clean_interval_secs: env_or(
                    "QUEUE_CLEAN_INTERVAL_SECS",
                    DEFAULT_CLEAN_INTERVAL_SECS,
                ),
                clean_limit: env_or("QUEUE_CLEAN_LIMIT", DEFAULT_CLEAN_LIMIT),
                event_capacity: env_or("QUEUE_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY),
                discovery_interval_secs: env_or(
                    "QUEUE_DISCOVERY_INTERVAL_SECS",
                    DEFAULT_DISCOVERY_INTERVAL_SECS,
                ),
            },
            ingest: IngestConfig::from_env(),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.queue.poll_interval_ms == 0 {
            anyhow::bail!("INGEST_POLL_INTERVAL_MS must be greater than 0");
        }

        if self.queue.clean_interval_secs == 0 {
            anyhow::bail!("QUEUE_CLEAN_INTERVAL_SECS must be greater than 0");
        }

        if self.queue.discovery_interval_secs == 0 {
            anyhow::bail!("QUEUE_DISCOVERY_INTERVAL_SECS must be greater than 0");
        }

        if self.queue.event_capacity == 0 {
            anyhow::bail!("QUEUE_EVENT_CAPACITY must be greater than 0");
        }

        self.ingest.validate()?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            queue: QueueConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}
