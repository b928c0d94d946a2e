//! Ingestion configuration
//!
//! Worker pool sizing, batching and inference limits, plus the issue logger's
//! buffering policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::env_or;

/// Default number of ingestion jobs run concurrently.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default rows per persisted batch.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Default number of data rows sampled for type inference.
pub const DEFAULT_SAMPLE_SIZE: usize = 1_000;

/// Default number of sample values kept per column.
pub const DEFAULT_SAMPLE_VALUES: usize = 5;

/// Default upper bound on source file size (100 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default retries allowed per job.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Worker tasks on the ingestion queue
    pub concurrency: usize,
    /// Rows per batch insert
    pub batch_size: usize,
    /// Data rows sampled during structure analysis
    pub sample_size: usize,
    /// Sample values recorded per column
    pub sample_values: usize,
    /// Largest accepted source file in bytes
    pub max_file_size: u64,
    /// Retries allowed per job
    pub max_retries: i32,
    /// Remove the uploaded file once its job completes
    pub delete_source_on_success: bool,
    pub issues: IssueLoggerConfig,
}

/// Issue logger buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueLoggerConfig {
    /// Buffered issues that trigger an immediate flush
    pub buffer_size: usize,
    /// Period of the background flush
    pub flush_interval_secs: u64,
    /// Capacity of the command channel feeding the flush task
    pub channel_capacity: usize,
    /// Issues kept while the store is failing; the oldest are dropped beyond this
    pub max_buffered: usize,
}

impl IssueLoggerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl Default for IssueLoggerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval_secs: 5,
            channel_capacity: 1_024,
            max_buffered: 50_000,
        }
    }
}

impl IngestConfig {
    /// Load ingestion configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = IssueLoggerConfig::default();

        Self {
            concurrency: env_or("INGEST_CONCURRENCY", DEFAULT_CONCURRENCY),
            batch_size: env_or("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            sample_size: env_or("INGEST_SAMPLE_SIZE", DEFAULT_SAMPLE_SIZE),
            sample_values: env_or("INGEST_SAMPLE_VALUES", DEFAULT_SAMPLE_VALUES),
            max_file_size: env_or("INGEST_MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE),
            max_retries: env_or("INGEST_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            delete_source_on_success: env_or("INGEST_DELETE_SOURCE", true),
            issues: IssueLoggerConfig {
                buffer_size: env_or("ISSUE_BUFFER_SIZE", defaults.buffer_size),
                flush_interval_secs: env_or(
                    "ISSUE_FLUSH_INTERVAL_SECS",
                    defaults.flush_interval_secs,
                ),
                ..defaults
            },
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("INGEST_CONCURRENCY must be greater than 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("INGEST_BATCH_SIZE must be greater than 0");
        }
        if self.sample_size == 0 {
            anyhow::bail!("INGEST_SAMPLE_SIZE must be greater than 0");
        }
        if self.max_file_size == 0 {
            anyhow::bail!("INGEST_MAX_FILE_SIZE must be greater than 0");
        }
        if self.max_retries < 0 {
            anyhow::bail!("INGEST_MAX_RETRIES cannot be negative");
        }
        if self.issues.buffer_size == 0 {
            anyhow::bail!("ISSUE_BUFFER_SIZE must be greater than 0");
        }
        if self.issues.flush_interval_secs == 0 {
            anyhow::bail!("ISSUE_FLUSH_INTERVAL_SECS must be greater than 0");
        }
        if self.issues.max_buffered < self.issues.buffer_size {
            anyhow::bail!(
                "Issue max_buffered ({}) cannot be smaller than ISSUE_BUFFER_SIZE ({})",
                self.issues.max_buffered,
                self.issues.buffer_size
            );
        }
        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            sample_values: DEFAULT_SAMPLE_VALUES,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            delete_source_on_success: true,
            issues: IssueLoggerConfig::default(),
        }
    }
}
