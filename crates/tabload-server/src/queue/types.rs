//! Queue job records, enqueue options and reporting types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::events::ProgressPayload;

/// Retries allowed for a queue job unless the caller says otherwise
pub const DEFAULT_JOB_MAX_RETRIES: u32 = 3;

/// Jobs shown per bucket in [`QueueStats`]
pub const STATS_SAMPLE_SIZE: usize = 5;

/// Lifecycle of a job inside one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueJobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl QueueJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueJobState::Waiting => "waiting",
            QueueJobState::Delayed => "delayed",
            QueueJobState::Active => "active",
            QueueJobState::Completed => "completed",
            QueueJobState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, QueueJobState::Completed | QueueJobState::Failed)
    }
}

impl std::fmt::Display for QueueJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a queued job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub state: QueueJobState,
    pub progress: Option<ProgressPayload>,
    /// Times a worker picked this job up
    pub attempts_made: u32,
    /// Re-admissions through `retry_failed_jobs`
    pub retry_count: u32,
    pub max_retries: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Earliest dispatch time
    pub run_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Options for [`JobQueueManager::add_job`](super::JobQueueManager::add_job)
#[derive(Debug, Clone)]
pub struct AddJobOptions {
    /// Higher runs first
    pub priority: i32,
    pub delay: Option<Duration>,
    /// Explicit id; generated when absent
    pub job_id: Option<String>,
    pub max_retries: u32,
}

impl Default for AddJobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: None,
            job_id: None,
            max_retries: DEFAULT_JOB_MAX_RETRIES,
        }
    }
}

impl AddJobOptions {
    pub fn with_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Per-queue settings fixed at registration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Worker tasks pulling from this queue
    pub concurrency: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Per-bucket counts for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// Stats returned by `get_queue_stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub paused: bool,
    pub counts: QueueCounts,
    /// Up to [`STATS_SAMPLE_SIZE`] recent jobs per bucket
    pub samples: QueueSamples,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSamples {
    pub waiting: Vec<QueueJob>,
    pub active: Vec<QueueJob>,
    pub completed: Vec<QueueJob>,
    pub failed: Vec<QueueJob>,
    pub delayed: Vec<QueueJob>,
}

/// Outcome of `retry_failed_jobs`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub retried: Vec<String>,
    /// Failed jobs left alone because they used all their retries
    pub exhausted: Vec<String>,
}

/// Health of a single queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub name: String,
    pub reachable: bool,
    pub paused: bool,
    pub live_workers: usize,
    pub concurrency: usize,
    pub counts: QueueCounts,
}

/// Result of `health_check`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub broker_connected: bool,
    pub broker_latency_ms: Option<u64>,
    pub broker_error: Option<String>,
    pub queues: Vec<QueueHealth>,
    pub checked_at: DateTime<Utc>,
}
