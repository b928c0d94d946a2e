//! Server-specific error types
//!
//! One `thiserror` enum per layer: the relational store, the job queue and
//! the ingestion pipeline. Per-row data-quality problems are never errors;
//! they are recorded as issues instead.

use thiserror::Error;
use uuid::Uuid;

use crate::ingest::models::JobStatus;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Errors raised by an [`IngestStore`](crate::store::IngestStore) implementation
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] tabload_common::TabloadError),

    #[error("Invalid stored value for {field}: {value}")]
    Decode { field: &'static str, value: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

/// Errors raised by the [`JobQueueManager`](crate::queue::JobQueueManager)
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue already registered: {0}")]
    QueueAlreadyRegistered(String),

    #[error("Job {job_id} already exists in queue {queue}")]
    DuplicateJob { queue: String, job_id: String },

    #[error("Job {job_id} not found in queue {queue}")]
    JobNotFound { queue: String, job_id: String },

    #[error("Job {job_id} is {state} and cannot be requeued")]
    NotRequeueable { job_id: String, state: String },

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Queue manager is closed")]
    Closed,
}

/// Errors raised by the CSV ingestion pipeline and its service facade
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("File validation failed: {0}")]
    FileValidation(String),

    #[error("Structural analysis failed: {0}")]
    StructuralAnalysis(String),

    #[error("Batch persist failed at row {first_row_index}: {source}")]
    BatchPersist {
        first_row_index: i64,
        #[source]
        source: StoreError,
    },

    #[error("Ingestion interrupted by shutdown")]
    Interrupted,

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {job_id} cannot be {action} while {status}")]
    InvalidStatus {
        job_id: Uuid,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Job {job_id} has used all {max_retries} retries")]
    MaxRetriesExceeded { job_id: Uuid, max_retries: i32 },

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Stable machine-readable code for clients and job records
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::FileValidation(_) => "FILE_VALIDATION_ERROR",
            IngestError::StructuralAnalysis(_) => "STRUCTURAL_ANALYSIS_ERROR",
            IngestError::BatchPersist { .. } => "BATCH_PERSIST_ERROR",
            IngestError::Interrupted => "INTERRUPTED",
            IngestError::JobNotFound(_) => "JOB_NOT_FOUND",
            IngestError::InvalidStatus { .. } => "INVALID_STATUS",
            IngestError::MaxRetriesExceeded { .. } => "MAX_RETRIES_EXCEEDED",
            IngestError::Payload(_) => "INVALID_PAYLOAD",
            IngestError::Queue(_) => "QUEUE_ERROR",
            IngestError::Store(_) => "STORE_ERROR",
        }
    }
}
