//! Ingestion service
//!
//! Entry point for the file-transport layer and administrative callers. Owns
//! the job record lifecycle outside of a worker run: submission, retry and
//! cancellation, plus read access to jobs, datasets and issues.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::IngestConfig;
use super::issues::IssueLogger;
use super::jobs::CsvIngestJob;
use super::models::{
    Dataset, DatasetRow, IngestOptions, IngestionJob, IssueFilter, IssueRecord, IssueSummary,
    JobStatus, SourceFile,
};
use super::worker::{CsvIngestionWorker, CSV_INGESTION_QUEUE};
use crate::error::{IngestError, IngestResult, QueueError};
use crate::pagination::{Paginated, PaginationParams};
use crate::queue::{AddJobOptions, JobQueueManager, QueueJobState, QueueOptions, QueueStats};
use crate::store::IngestStore;

/// Result of [`IngestionService::retry_failed_jobs`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrySummary {
    pub retried: Vec<Uuid>,
    pub rejected: Vec<RetryRejection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryRejection {
    pub job_id: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Clone)]
pub struct IngestionService {
    store: Arc<dyn IngestStore>,
    queue: Arc<JobQueueManager>,
    config: IngestConfig,
}

impl IngestionService {
    pub fn new(store: Arc<dyn IngestStore>, queue: Arc<JobQueueManager>, config: IngestConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Register the CSV worker pool on the `csv-ingestion` queue
    pub async fn start_workers(&self, issues: IssueLogger) -> IngestResult<()> {
        let worker = CsvIngestionWorker::new(Arc::clone(&self.store), issues, self.config.clone());
        self.queue
            .register_queue(
                CSV_INGESTION_QUEUE,
                QueueOptions {
                    concurrency: self.config.concurrency,
                },
                Arc::new(worker),
            )
            .await?;
        Ok(())
    }

    /// Create a pending job for an uploaded file and enqueue it
    pub async fn submit(&self, source: SourceFile, options: IngestOptions) -> IngestResult<IngestionJob> {
        let job = IngestionJob::new(source, options, self.config.max_retries);
        self.store.create_job(&job).await?;

        match self.enqueue(job.id).await {
            Ok(()) => {}
            // discovery picked the record up first
            Err(IngestError::Queue(QueueError::DuplicateJob { .. })) => {
                debug!(job_id = %job.id, "Job already enqueued by discovery");
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to enqueue ingestion job");
                self.store.fail_job(job.id, &e.to_string()).await?;
                return Err(e);
            }
        }

        info!(
            job_id = %job.id,
            path = %job.source.path,
            declared_size = job.source.declared_size,
            "Ingestion job submitted"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> IngestResult<IngestionJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(IngestError::JobNotFound(job_id))
    }

    pub async fn get_dataset_for_job(&self, job_id: Uuid) -> IngestResult<Option<Dataset>> {
        Ok(self.store.get_dataset_by_job(job_id).await?)
    }

    /// Re-run a failed job with its original file reference and options
    pub async fn retry_job(&self, job_id: Uuid) -> IngestResult<IngestionJob> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(IngestError::InvalidStatus {
                job_id,
                status: job.status,
                action: "retried",
            });
        }
        if !job.can_retry() {
            return Err(IngestError::MaxRetriesExceeded {
                job_id,
                max_retries: job.max_retries,
            });
        }

        let queue_id = job_id.to_string();
        if let Some(entry) = self.queue.get_job(CSV_INGESTION_QUEUE, &queue_id).await? {
            if !entry.state.is_finished() {
                return Err(QueueError::NotRequeueable {
                    job_id: queue_id,
                    state: entry.state.to_string(),
                }
                .into());
            }
        }

        if !self.store.reset_job_for_retry(job_id).await? {
            // lost a race with another retry or status change
            let current = self.get_job(job_id).await?;
            return Err(if current.status == JobStatus::Failed {
                IngestError::MaxRetriesExceeded {
                    job_id,
                    max_retries: current.max_retries,
                }
            } else {
                IngestError::InvalidStatus {
                    job_id,
                    status: current.status,
                    action: "retried",
                }
            });
        }

        match self.queue.requeue_job(CSV_INGESTION_QUEUE, &queue_id).await {
            Ok(_) => {}
            // cleaned from the queue already
            Err(QueueError::JobNotFound { .. }) => self.enqueue(job_id).await?,
            Err(e) => return Err(e.into()),
        }

        let job = self.get_job(job_id).await?;
        info!(job_id = %job_id, retry_count = job.retry_count, "Ingestion job re-queued");
        Ok(job)
    }

    /// Cancel a pending or processing job. Rows already written are kept.
    pub async fn cancel_job(&self, job_id: Uuid) -> IngestResult<IngestionJob> {
        let job = self.get_job(job_id).await?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            return Err(IngestError::InvalidStatus {
                job_id,
                status: job.status,
                action: "cancelled",
            });
        }

        self.store.cancel_job(job_id, None).await?;

        let queue_id = job_id.to_string();
        if !self.queue.remove_job(CSV_INGESTION_QUEUE, &queue_id).await? {
            // running; the worker stops at the next batch boundary
            let signalled = self.queue.cancel_job(CSV_INGESTION_QUEUE, &queue_id).await?;
            debug!(job_id = %job_id, signalled, "Cancellation signalled to worker");
        }

        info!(job_id = %job_id, previous_status = %job.status, "Ingestion job cancelled");
        self.get_job(job_id).await
    }

    /// Apply [`retry_job`](Self::retry_job) to every failed job in the queue
    pub async fn retry_failed_jobs(&self) -> IngestResult<RetrySummary> {
        let failed = self
            .queue
            .jobs_in_state(CSV_INGESTION_QUEUE, QueueJobState::Failed)
            .await?;

        let mut summary = RetrySummary::default();
        for entry in failed {
            let Ok(job_id) = Uuid::parse_str(&entry.id) else {
                warn!(job_id = %entry.id, "Skipping queue job with a non-UUID id");
                continue;
            };
            match self.retry_job(job_id).await {
                Ok(_) => summary.retried.push(job_id),
                Err(e) => summary.rejected.push(RetryRejection {
                    job_id: entry.id,
                    code: e.code(),
                    message: e.to_string(),
                }),
            }
        }

        info!(
            retried = summary.retried.len(),
            rejected = summary.rejected.len(),
            "Retried failed ingestion jobs"
        );
        Ok(summary)
    }

    /// Enqueue pending or interrupted job records the queue does not know
    /// about, such as rows written by another process or left behind by a
    /// restart. Returns the number of jobs enqueued.
    pub async fn enqueue_pending(&self, limit: i64) -> IngestResult<usize> {
        let jobs = self
            .store
            .list_jobs(&[JobStatus::Pending, JobStatus::Processing], limit)
            .await?;

        let mut enqueued = 0;
        for job in jobs {
            let queue_id = job.id.to_string();
            match self.queue.get_job(CSV_INGESTION_QUEUE, &queue_id).await? {
                None => match self.enqueue(job.id).await {
                    Ok(()) => {}
                    // submitted concurrently
                    Err(IngestError::Queue(QueueError::DuplicateJob { .. })) => continue,
                    Err(e) => return Err(e),
                },
                Some(entry) if entry.state.is_finished() => {
                    self.queue
                        .requeue_job(CSV_INGESTION_QUEUE, &queue_id)
                        .await?;
                }
                Some(_) => continue,
            }
            debug!(job_id = %job.id, status = %job.status, "Discovered job enqueued");
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(enqueued, "Enqueued pending ingestion jobs");
        }
        Ok(enqueued)
    }

    pub async fn issue_summary(&self, dataset_id: Uuid) -> IngestResult<IssueSummary> {
        Ok(self.store.issue_summary(dataset_id).await?)
    }

    pub async fn list_issues(
        &self,
        dataset_id: Uuid,
        filter: &IssueFilter,
        page: &PaginationParams,
    ) -> IngestResult<Paginated<IssueRecord>> {
        Ok(self.store.list_issues(dataset_id, filter, page).await?)
    }

    pub async fn list_rows(
        &self,
        dataset_id: Uuid,
        page: &PaginationParams,
    ) -> IngestResult<Paginated<DatasetRow>> {
        Ok(self.store.list_rows(dataset_id, page).await?)
    }

    pub async fn queue_stats(&self) -> IngestResult<QueueStats> {
        Ok(self.queue.get_queue_stats(CSV_INGESTION_QUEUE).await?)
    }

    async fn enqueue(&self, job_id: Uuid) -> IngestResult<()> {
        let payload = serde_json::to_value(CsvIngestJob::new(job_id))?;
        // retries go through retry_job so the job record and queue stay in step
        let options = AddJobOptions::with_id(job_id.to_string()).max_retries(0);
        self.queue
            .add_job(CSV_INGESTION_QUEUE, payload, options)
            .await?;
        Ok(())
    }
}
