//! Lifecycle events published by the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of a running job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    /// 0-100, never decreasing for one job
    pub percentage: f64,
    pub current_step: String,
    pub processed_rows: u64,
    pub total_rows: Option<u64>,
    /// Rows per second in the current stage
    pub processing_speed: Option<f64>,
    /// Seconds left, when a speed is known
    pub estimated_time_remaining: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload", rename_all = "lowercase")]
pub enum QueueEventKind {
    Waiting,
    Active,
    Progress(ProgressPayload),
    Completed(serde_json::Value),
    Failed { error: String },
    /// The processor died without reporting a result
    Stalled,
}

impl QueueEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            QueueEventKind::Waiting => "waiting",
            QueueEventKind::Active => "active",
            QueueEventKind::Progress(_) => "progress",
            QueueEventKind::Completed(_) => "completed",
            QueueEventKind::Failed { .. } => "failed",
            QueueEventKind::Stalled => "stalled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueEventKind::Completed(_) | QueueEventKind::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub job_id: String,
    pub queue_name: String,
    #[serde(flatten)]
    pub kind: QueueEventKind,
    pub occurred_at: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(queue: &str, job_id: &str, kind: QueueEventKind) -> Self {
        Self {
            job_id: job_id.to_string(),
            queue_name: queue.to_string(),
            kind,
            occurred_at: Utc::now(),
        }
    }
}
