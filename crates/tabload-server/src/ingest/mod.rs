//! CSV ingestion pipeline
//!
//! Turns an uploaded CSV file into a dataset: a schema, one JSON row per data
//! row and a list of data-quality issues.
//!
//! # Architecture
//!
//! - **config**: Worker and issue logger settings (INGEST_* / ISSUE_* environment variables)
//! - **models**: Job, dataset, row and issue records
//! - **jobs**: Queue payload and per-run statistics
//! - **reader**: Streaming CSV reader with delimiter and encoding handling
//! - **schema**: Column type inference over a bounded sample
//! - **quality**: Per-cell checks run while rows are streamed
//! - **issues**: Batched, asynchronous issue logger
//! - **progress**: Stage-banded progress snapshots
//! - **worker**: The `csv-ingestion` queue processor
//! - **service**: Submission, retry, cancellation and read access
//!
//! # Job lifecycle
//!
//! ```text
//! pending -> processing -> completed
//!               |   \
//!               |    -> failed -> (retry) -> pending
//!               v
//!           cancelled
//! ```

pub mod config;
pub mod issues;
pub mod jobs;
pub mod models;
pub mod progress;
pub mod quality;
pub mod reader;
pub mod schema;
pub mod service;
pub mod worker;

pub use config::{IngestConfig, IssueLoggerConfig};
pub use issues::{IssueLogError, IssueLogger, IssueScope, IssueSink};
pub use jobs::{CsvIngestJob, IngestOutcome, ProcessingStats};
pub use models::{
    Dataset, DatasetRow, DatasetStatus, IngestOptions, IngestionJob, IssueCategory, IssueFilter,
    IssueRecord, IssueSeverity, IssueSummary, JobStatus, NewIssue, SourceFile,
};
pub use progress::{IngestStage, ProgressTracker};
pub use schema::{analyze_structure, StructureAnalysis};
pub use service::{IngestionService, RetrySummary};
pub use worker::{CsvIngestionWorker, CSV_INGESTION_QUEUE};
