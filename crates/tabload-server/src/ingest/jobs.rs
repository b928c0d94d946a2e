//! Queue payloads and run statistics for CSV ingestion

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::JobStatus;

/// Payload placed on the `csv-ingestion` queue
///
/// Only the job id travels through the queue; the file reference and options
/// are re-read from the job record so a retry always sees the original request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvIngestJob {
    pub job_id: Uuid,
    /// Timestamp when the payload was enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl CsvIngestJob {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// Statistics collected during one ingestion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessingStats {
    /// Data rows read from the source
    pub total_rows: i64,
    /// Rows without any recorded issue
    pub valid_rows: i64,
    /// Rows with at least one recorded issue
    pub invalid_rows: i64,
    /// Issues raised by the quality checks
    pub issues_logged: i64,
    /// Batches written
    pub batches: i64,
    /// Largest batch buffer held, in cells (rows x columns)
    pub peak_batch_cells: i64,
    /// SHA-256 of the source file
    pub source_sha256: Option<String>,
    /// Set when the run stopped on a cancellation request
    pub cancelled: bool,
    /// Duration in seconds
    pub duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark stats as completed
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
    }

    /// Count one streamed row
    pub fn record_row(&mut self, issues: usize) {
        self.total_rows += 1;
        if issues == 0 {
            self.valid_rows += 1;
        } else {
            self.invalid_rows += 1;
            self.issues_logged += issues as i64;
        }
    }

    /// Count one written batch of `rows` rows with `columns` cells each
    pub fn record_batch(&mut self, rows: usize, columns: usize) {
        self.batches += 1;
        self.peak_batch_cells = self.peak_batch_cells.max((rows * columns) as i64);
    }

    /// Rows per second over the whole run
    pub fn rows_per_second(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.total_rows as f64 / self.duration_secs
        } else {
            0.0
        }
    }

    /// JSON form stored on the job and dataset records
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("rows_per_second".into(), self.rows_per_second().into());
        }
        value
    }
}

/// Value returned to the queue when a run ends without error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub dataset_id: Option<Uuid>,
    pub total_rows: i64,
    pub issues_logged: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_rows_splits_valid_and_invalid() {
        let mut stats = ProcessingStats::new();
        stats.record_row(0);
        stats.record_row(2);
        stats.record_row(0);

        assert_eq!(stats.total_rows, 3);
        assert_eq!(stats.valid_rows, 2);
        assert_eq!(stats.invalid_rows, 1);
        assert_eq!(stats.issues_logged, 2);
    }

    #[test]
    fn test_peak_batch_cells_keeps_maximum() {
        let mut stats = ProcessingStats::default();
        stats.record_batch(1000, 4);
        stats.record_batch(10, 4);

        assert_eq!(stats.batches, 2);
        assert_eq!(stats.peak_batch_cells, 4000);
    }

    #[test]
    fn test_rows_per_second() {
        let mut stats = ProcessingStats::default();
        assert_eq!(stats.rows_per_second(), 0.0);

        stats.total_rows = 500;
        stats.duration_secs = 2.0;
        assert_eq!(stats.rows_per_second(), 250.0);
        assert_eq!(stats.to_json()["rows_per_second"], 250.0);
    }

    #[test]
    fn test_complete_sets_duration() {
        let mut stats = ProcessingStats::new();
        stats.complete();
        assert!(stats.completed_at.is_some());
        assert!(stats.duration_secs >= 0.0);
    }

    #[test]
    fn test_payload_roundtrip() {
        let job = CsvIngestJob::new(Uuid::new_v4());
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("job_id").is_some());

        let decoded: CsvIngestJob = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, job);
    }
}
