//! Relational store for jobs, datasets, rows and issues
//!
//! [`IngestStore`] is the seam between the pipeline and persistence. The
//! production implementation is [`PgStore`]; [`MemoryStore`] backs tests and
//! the `ingest --memory` dry run.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::ingest::models::{
    Dataset, DatasetRow, DatasetStatus, IngestionJob, IssueFilter, IssueRecord, IssueSummary,
    JobStatus,
};
use crate::pagination::{Paginated, PaginationParams};
use crate::queue::ProgressPayload;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait IngestStore: Send + Sync {
    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn create_job(&self, job: &IngestionJob) -> StoreResult<()>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<IngestionJob>>;

    /// Jobs in any of `statuses`, oldest first
    async fn list_jobs(&self, statuses: &[JobStatus], limit: i64) -> StoreResult<Vec<IngestionJob>>;

    async fn mark_job_processing(&self, id: Uuid) -> StoreResult<()>;

    /// Persist a progress snapshot; the stored percentage never goes down
    async fn update_job_progress(&self, id: Uuid, progress: &ProgressPayload) -> StoreResult<()>;

    async fn set_job_dataset(&self, id: Uuid, dataset_id: Uuid) -> StoreResult<()>;

    /// Processing -> completed. Returns false when the job was no longer
    /// processing, e.g. cancelled meanwhile; it is left untouched.
    async fn complete_job(&self, id: Uuid, stats: &serde_json::Value) -> StoreResult<bool>;

    /// Any non-terminal status -> failed
    async fn fail_job(&self, id: Uuid, message: &str) -> StoreResult<()>;

    /// Pending or processing -> cancelled; a cancelled job only takes the final stats
    async fn cancel_job(&self, id: Uuid, stats: Option<&serde_json::Value>) -> StoreResult<()>;

    /// Failed -> pending with `retry_count + 1`, only while retries remain.
    /// Returns false when the job was not eligible.
    async fn reset_job_for_retry(&self, id: Uuid) -> StoreResult<bool>;

    // ------------------------------------------------------------------
    // Datasets
    // ------------------------------------------------------------------

    /// Create the job's dataset, or reset the existing one to `processing`
    /// with the new schema. Returns the id that is in effect.
    async fn upsert_dataset(&self, dataset: &Dataset) -> StoreResult<Uuid>;

    async fn get_dataset(&self, id: Uuid) -> StoreResult<Option<Dataset>>;

    async fn get_dataset_by_job(&self, job_id: Uuid) -> StoreResult<Option<Dataset>>;

    async fn finalize_dataset(
        &self,
        id: Uuid,
        status: DatasetStatus,
        total_rows: i64,
        stats: &serde_json::Value,
    ) -> StoreResult<()>;

    async fn fail_dataset(&self, id: Uuid, message: &str) -> StoreResult<()>;

    // ------------------------------------------------------------------
    // Rows
    // ------------------------------------------------------------------

    /// Insert rows, skipping any (dataset_id, row_index) that already exists.
    /// Returns the number of rows actually inserted.
    async fn insert_rows(&self, rows: &[DatasetRow]) -> StoreResult<u64>;

    async fn count_rows(&self, dataset_id: Uuid) -> StoreResult<i64>;

    /// Rows ordered by row_index
    async fn list_rows(
        &self,
        dataset_id: Uuid,
        page: &PaginationParams,
    ) -> StoreResult<Paginated<DatasetRow>>;

    // ------------------------------------------------------------------
    // Issues (writes go through `IssueSink`)
    // ------------------------------------------------------------------

    async fn issue_summary(&self, dataset_id: Uuid) -> StoreResult<IssueSummary>;

    async fn list_issues(
        &self,
        dataset_id: Uuid,
        filter: &IssueFilter,
        page: &PaginationParams,
    ) -> StoreResult<Paginated<IssueRecord>>;
}
