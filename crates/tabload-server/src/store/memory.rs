//! In-memory store

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::IngestStore;
use crate::error::{StoreError, StoreResult};
use crate::ingest::issues::IssueSink;
use crate::ingest::models::{
    Dataset, DatasetRow, DatasetStatus, IngestionJob, IssueFilter, IssueRecord, IssueSummary,
    JobStatus, NewIssue,
};
use crate::pagination::{Paginated, PaginationParams};
use crate::queue::{Broker, ProgressPayload};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, IngestionJob>,
    datasets: HashMap<Uuid, Dataset>,
    rows: HashMap<Uuid, BTreeMap<i64, DatasetRow>>,
    issues: Vec<IssueRecord>,
}

/// Store keeping everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored issue of a dataset, in insertion order
    pub async fn issues_for(&self, dataset_id: Uuid) -> Vec<NewIssue> {
        self.state
            .read()
            .await
            .issues
            .iter()
            .filter(|r| r.issue.dataset_id == dataset_id)
            .map(|r| r.issue.clone())
            .collect()
    }
}

fn job_not_found(id: Uuid) -> StoreError {
    StoreError::NotFound {
        entity: "ingestion job",
        id: id.to_string(),
    }
}

fn dataset_not_found(id: Uuid) -> StoreError {
    StoreError::NotFound {
        entity: "dataset",
        id: id.to_string(),
    }
}

impl MemoryState {
    fn job_mut(&mut self, id: Uuid) -> StoreResult<&mut IngestionJob> {
        self.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))
    }

    fn dataset_mut(&mut self, id: Uuid) -> StoreResult<&mut Dataset> {
        self.datasets.get_mut(&id).ok_or_else(|| dataset_not_found(id))
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn create_job(&self, job: &IngestionJob) -> StoreResult<()> {
        self.state.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<IngestionJob>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, statuses: &[JobStatus], limit: i64) -> StoreResult<Vec<IngestionJob>> {
        let state = self.state.read().await;
        let mut jobs: Vec<IngestionJob> = state
            .jobs
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn mark_job_processing(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if !job.status.is_terminal() {
            job.status = JobStatus::Processing;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_job_progress(&self, id: Uuid, progress: &ProgressPayload) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        job.progress_percentage = job.progress_percentage.max(progress.percentage);
        job.current_step = Some(progress.current_step.clone());
        job.rows_processed = progress.processed_rows as i64;
        job.total_rows_estimated = progress.total_rows.map(|t| t as i64);
        job.processing_speed = progress.processing_speed;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_job_dataset(&self, id: Uuid, dataset_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        job.dataset_id = Some(dataset_id);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_job(&self, id: Uuid, stats: &serde_json::Value) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Processing {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.progress_percentage = 100.0;
        job.processing_stats = Some(stats.clone());
        job.error_message = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn fail_job(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if !job.status.is_terminal() {
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.error_message = Some(message.to_string());
            job.completed_at = Some(now);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn cancel_job(&self, id: Uuid, stats: Option<&serde_json::Value>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if matches!(
            job.status,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Cancelled
        ) {
            let now = Utc::now();
            job.status = JobStatus::Cancelled;
            if let Some(stats) = stats {
                job.processing_stats = Some(stats.clone());
            }
            job.completed_at.get_or_insert(now);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn reset_job_for_retry(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if !job.can_retry() {
            return Ok(false);
        }

        job.status = JobStatus::Pending;
        job.retry_count += 1;
        job.error_message = None;
        job.completed_at = None;
        job.progress_percentage = 0.0;
        job.current_step = None;
        job.rows_processed = 0;
        job.processing_speed = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn upsert_dataset(&self, dataset: &Dataset) -> StoreResult<Uuid> {
        let mut state = self.state.write().await;

        let existing = state
            .datasets
            .values_mut()
            .find(|d| d.job_id == dataset.job_id);
        if let Some(existing) = existing {
            existing.name = dataset.name.clone();
            existing.total_columns = dataset.total_columns;
            existing.column_schema = dataset.column_schema.clone();
            existing.status = DatasetStatus::Processing;
            existing.error_message = None;
            existing.updated_at = Utc::now();
            return Ok(existing.id);
        }

        state.datasets.insert(dataset.id, dataset.clone());
        Ok(dataset.id)
    }

    async fn get_dataset(&self, id: Uuid) -> StoreResult<Option<Dataset>> {
        Ok(self.state.read().await.datasets.get(&id).cloned())
    }

    async fn get_dataset_by_job(&self, job_id: Uuid) -> StoreResult<Option<Dataset>> {
        Ok(self
            .state
            .read()
            .await
            .datasets
            .values()
            .find(|d| d.job_id == job_id)
            .cloned())
    }

    async fn finalize_dataset(
        &self,
        id: Uuid,
        status: DatasetStatus,
        total_rows: i64,
        stats: &serde_json::Value,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let dataset = state.dataset_mut(id)?;
        dataset.status = status;
        dataset.total_rows = total_rows;
        dataset.processing_stats = Some(stats.clone());
        dataset.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_dataset(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let dataset = state.dataset_mut(id)?;
        dataset.status = DatasetStatus::Failed;
        dataset.error_message = Some(message.to_string());
        dataset.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_rows(&self, rows: &[DatasetRow]) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for row in rows {
            let table = state.rows.entry(row.dataset_id).or_default();
            if let std::collections::btree_map::Entry::Vacant(slot) = table.entry(row.row_index) {
                slot.insert(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn count_rows(&self, dataset_id: Uuid) -> StoreResult<i64> {
        let state = self.state.read().await;
        Ok(state.rows.get(&dataset_id).map_or(0, |t| t.len() as i64))
    }

    async fn list_rows(
        &self,
        dataset_id: Uuid,
        page: &PaginationParams,
    ) -> StoreResult<Paginated<DatasetRow>> {
        let state = self.state.read().await;
        let Some(table) = state.rows.get(&dataset_id) else {
            return Ok(Paginated::new(Vec::new(), page, 0));
        };

        let items = table
            .values()
            .skip(page.offset() as usize)
            .take(page.per_page() as usize)
            .cloned()
            .collect();
        Ok(Paginated::new(items, page, table.len() as i64))
    }

    async fn issue_summary(&self, dataset_id: Uuid) -> StoreResult<IssueSummary> {
        let state = self.state.read().await;
        let mut summary = IssueSummary::default();
        for record in state.issues.iter().filter(|r| r.issue.dataset_id == dataset_id) {
            summary.add(record.issue.severity, record.issue.category, 1);
        }
        Ok(summary)
    }

    async fn list_issues(
        &self,
        dataset_id: Uuid,
        filter: &IssueFilter,
        page: &PaginationParams,
    ) -> StoreResult<Paginated<IssueRecord>> {
        let state = self.state.read().await;
        let mut matching: Vec<&IssueRecord> = state
            .issues
            .iter()
            .filter(|r| r.issue.dataset_id == dataset_id && filter.matches(&r.issue))
            .collect();
        matching.sort_by_key(|r| (r.issue.row_number.unwrap_or(0), r.id));

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page() as usize)
            .cloned()
            .collect();
        Ok(Paginated::new(items, page, total))
    }
}

#[async_trait]
impl IssueSink for MemoryStore {
    async fn write_issues(&self, issues: &[NewIssue]) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        for issue in issues {
            let id = state.issues.len() as i64 + 1;
            state.issues.push(IssueRecord {
                id,
                issue: issue.clone(),
            });
        }
        Ok(issues.len() as u64)
    }
}

#[async_trait]
impl Broker for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
