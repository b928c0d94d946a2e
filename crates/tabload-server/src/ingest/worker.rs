//! CSV ingestion worker
//!
//! Runs one ingestion job through its stages:
//!
//! 1. **Validating** - file exists, size matches the declared size and the
//!    configured ceiling, options are usable, checksum recorded
//! 2. **AnalyzingStructure** - one streaming pass for schema and row count
//! 3. **CreatingDatasetRecord** - dataset row written before any data
//! 4. **StreamingBatchInsert** - second pass, quality checks per cell,
//!    idempotent batch writes keyed by (dataset_id, row_index)
//! 5. **Finalizing** - row count, dataset activation, issue flush, job
//!    completion, source cleanup
//!
//! Cancellation and shutdown are observed between batches. A cancelled job
//! ends `cancelled` with a `failed` dataset. On shutdown the job stays
//! `processing` so discovery resumes it after a restart. Any stage error
//! fails the job; rows and issues written so far are kept and the source
//! file stays in place.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::IngestConfig;
use super::issues::{IssueLogger, IssueScope};
use super::jobs::{CsvIngestJob, IngestOutcome, ProcessingStats};
use super::models::{Dataset, DatasetRow, DatasetStatus, IngestionJob, JobStatus};
use super::progress::{IngestStage, ProgressTracker};
use super::quality::{CellProblem, CheckedRow, RowChecker};
use super::reader::{validate_options, CsvRowReader};
use super::schema::analyze_structure;
use crate::error::{IngestError, IngestResult};
use crate::queue::{JobContext, JobProcessor, ProgressPayload};
use crate::store::IngestStore;
use tabload_common::checksum::compute_file_checksum;

/// Queue the worker is registered on
pub const CSV_INGESTION_QUEUE: &str = "csv-ingestion";

pub struct CsvIngestionWorker {
    store: Arc<dyn IngestStore>,
    issues: IssueLogger,
    config: IngestConfig,
}

/// Mutable state of one run
struct Run {
    tracker: ProgressTracker,
    stats: ProcessingStats,
    dataset_id: Option<Uuid>,
}

impl CsvIngestionWorker {
    pub fn new(store: Arc<dyn IngestStore>, issues: IssueLogger, config: IngestConfig) -> Self {
        Self {
            store,
            issues,
            config,
        }
    }

    /// Process the job record `job_id`
    pub async fn run_job(&self, ctx: &JobContext, job_id: Uuid) -> IngestResult<IngestOutcome> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(IngestError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Pending | JobStatus::Processing => {}
            JobStatus::Completed | JobStatus::Cancelled => {
                info!(job_id = %job_id, status = %job.status, "Skipping job that already ended");
                return Ok(IngestOutcome {
                    job_id,
                    status: job.status,
                    dataset_id: job.dataset_id,
                    total_rows: 0,
                    issues_logged: 0,
                });
            }
            JobStatus::Failed => {
                return Err(IngestError::InvalidStatus {
                    job_id,
                    status: job.status,
                    action: "process",
                })
            }
        }

        self.store.mark_job_processing(job_id).await?;
        info!(
            job_id = %job_id,
            path = %job.source.path,
            attempt = job.retry_count + 1,
            "Starting CSV ingestion"
        );

        let mut run = Run {
            tracker: ProgressTracker::new(),
            stats: ProcessingStats::new(),
            dataset_id: job.dataset_id,
        };

        match self.execute(ctx, &job, &mut run).await {
            Ok(outcome) => Ok(outcome),
            Err(IngestError::Interrupted) => {
                info!(
                    job_id = %job_id,
                    rows_read = run.stats.total_rows,
                    "CSV ingestion interrupted by shutdown; left for discovery"
                );
                self.flush_issues(job_id).await;
                Err(IngestError::Interrupted)
            }
            Err(err) => {
                self.record_failure(&job, run.dataset_id, &err).await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &JobContext,
        job: &IngestionJob,
        run: &mut Run,
    ) -> IngestResult<IngestOutcome> {
        let path = PathBuf::from(&job.source.path);

        // Validating
        let progress = run.tracker.enter(IngestStage::Validating);
        self.publish(ctx, job.id, progress).await;
        validate_options(&job.options)?;
        let digest = self.validate_file(&path, job.source.declared_size).await?;
        run.stats.source_sha256 = Some(digest);

        // AnalyzingStructure
        let progress = run.tracker.enter(IngestStage::AnalyzingStructure);
        self.publish(ctx, job.id, progress).await;
        let analysis = analyze_structure(
            &path,
            &job.options,
            self.config.sample_size,
            self.config.sample_values,
        )
        .await?;
        run.tracker.set_total_rows(analysis.total_rows);
        debug!(
            job_id = %job.id,
            columns = analysis.column_schema.len(),
            total_rows = analysis.total_rows,
            "Schema inferred"
        );

        if let Some(stopped) = self.check_stop(ctx, job, run).await {
            return stopped;
        }

        // CreatingDatasetRecord
        let progress = run.tracker.enter(IngestStage::CreatingDatasetRecord);
        self.publish(ctx, job.id, progress).await;
        let dataset = Dataset::new(
            job.id,
            job.source.dataset_name(),
            analysis.column_schema.clone(),
        );
        let dataset_id = self.store.upsert_dataset(&dataset).await?;
        self.store.set_job_dataset(job.id, dataset_id).await?;
        run.dataset_id = Some(dataset_id);
        let scope = IssueScope::new(dataset_id, Some(job.id));

        // StreamingBatchInsert
        let progress = run.tracker.enter(IngestStage::StreamingBatchInsert);
        self.publish(ctx, job.id, progress).await;

        let checker = RowChecker::new(&analysis.column_schema, analysis.header_width)?;
        let batch_size = self.config.batch_size.max(1);
        let mut reader = CsvRowReader::open(&path, &job.options).await?;
        let mut batch: Vec<DatasetRow> = Vec::with_capacity(batch_size);
        let mut streamed: u64 = 0;

        while let Some(raw) = reader.next_row().await? {
            let checked = checker.check(&raw);
            run.stats.record_row(checked.problems.len());
            self.log_problems(&scope, &checked).await;
            batch.push(DatasetRow {
                dataset_id,
                row_index: checked.index as i64,
                data: checked.data,
                content_hash: checked.content_hash,
            });

            if batch.len() >= batch_size {
                streamed += self.write_batch(&mut batch, checker.width(), run).await?;
                let progress = run.tracker.advance(streamed);
                self.publish(ctx, job.id, progress).await;

                if let Some(stopped) = self.check_stop(ctx, job, run).await {
                    return stopped;
                }
            }
        }
        if !batch.is_empty() {
            streamed += self.write_batch(&mut batch, checker.width(), run).await?;
        }
        let progress = run.tracker.advance(streamed);
        self.publish(ctx, job.id, progress).await;

        if let Some(stopped) = self.check_stop(ctx, job, run).await {
            return stopped;
        }

        // Finalizing
        let progress = run.tracker.enter(IngestStage::Finalizing);
        self.publish(ctx, job.id, progress).await;

        let total_rows = self.store.count_rows(dataset_id).await?;
        run.stats.complete();
        let stats = run.stats.to_json();
        self.store
            .finalize_dataset(dataset_id, DatasetStatus::Active, total_rows, &stats)
            .await?;
        self.flush_issues(job.id).await;

        if !self.store.complete_job(job.id, &stats).await? {
            return self.finish_not_completed(job, run).await;
        }

        if self.config.delete_source_on_success {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(job_id = %job.id, path = %path.display(), error = %e, "Failed to delete source file");
            }
        }

        let progress = run.tracker.enter(IngestStage::Completed);
        self.publish(ctx, job.id, progress).await;

        info!(
            job_id = %job.id,
            dataset_id = %dataset_id,
            total_rows,
            issues = run.stats.issues_logged,
            duration_secs = run.stats.duration_secs,
            "CSV ingestion completed"
        );

        Ok(IngestOutcome {
            job_id: job.id,
            status: JobStatus::Completed,
            dataset_id: Some(dataset_id),
            total_rows,
            issues_logged: run.stats.issues_logged,
        })
    }

    /// Check the source file and return its SHA-256
    async fn validate_file(&self, path: &Path, declared_size: i64) -> IngestResult<String> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            IngestError::FileValidation(format!("source file {} is not readable: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(IngestError::FileValidation(format!(
                "source path {} is not a regular file",
                path.display()
            )));
        }

        let actual = metadata.len();
        if u64::try_from(declared_size).ok() != Some(actual) {
            return Err(IngestError::FileValidation(format!(
                "size mismatch: declared {declared_size}, actual {actual}"
            )));
        }
        if actual > self.config.max_file_size {
            return Err(IngestError::FileValidation(format!(
                "file size {actual} exceeds the maximum of {} bytes",
                self.config.max_file_size
            )));
        }

        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || compute_file_checksum(owned))
            .await
            .map_err(|e| IngestError::FileValidation(format!("checksum task failed: {e}")))?
            .map_err(|e| IngestError::FileValidation(format!("cannot read source file: {e}")))
    }

    /// Write and clear `batch`; returns the number of rows it held
    async fn write_batch(
        &self,
        batch: &mut Vec<DatasetRow>,
        columns: usize,
        run: &mut Run,
    ) -> IngestResult<u64> {
        let Some(first_row_index) = batch.first().map(|row| row.row_index) else {
            return Ok(0);
        };
        run.stats.record_batch(batch.len(), columns);

        let inserted = self
            .store
            .insert_rows(batch)
            .await
            .map_err(|source| IngestError::BatchPersist {
                first_row_index,
                source,
            })?;
        debug!(
            first_row_index,
            rows = batch.len(),
            inserted,
            "Batch written"
        );

        let rows = batch.len() as u64;
        batch.clear();
        Ok(rows)
    }

    async fn log_problems(&self, scope: &IssueScope, row: &CheckedRow) {
        let row_number = row.row_number();
        for problem in &row.problems {
            let logged = match problem {
                CellProblem::Missing { column, nullable } => {
                    self.issues
                        .log_missing_value(scope, row_number, column, *nullable)
                        .await
                }
                CellProblem::TypeMismatch {
                    column,
                    value,
                    expected,
                } => {
                    self.issues
                        .log_type_mismatch(scope, row_number, column, value, *expected)
                        .await
                }
                CellProblem::InvalidEmail { column, value } => {
                    self.issues
                        .log_validation_error(
                            scope,
                            row_number,
                            column,
                            value,
                            &format!("Invalid email address in column '{column}'"),
                        )
                        .await
                }
                CellProblem::ExtraCells { cells, expected } => {
                    self.issues
                        .log_parsing_error(
                            scope,
                            Some(row_number),
                            &format!("Row has {cells} cells, expected {expected}"),
                            Some(json!({ "cells": cells, "expected": expected })),
                        )
                        .await
                }
            };
            if let Err(e) = logged {
                warn!(dataset_id = %scope.dataset_id, row_number, error = %e, "Failed to record issue");
            }
        }
    }

    /// Stop the run when the job was cancelled or the manager is closing
    async fn check_stop(
        &self,
        ctx: &JobContext,
        job: &IngestionJob,
        run: &mut Run,
    ) -> Option<IngestResult<IngestOutcome>> {
        if ctx.is_cancelled() {
            return Some(self.finish_cancelled(job, run).await);
        }
        if !ctx.is_shutting_down() {
            return None;
        }
        // a cancel recorded just before shutdown still wins
        match self.store.get_job(job.id).await {
            Ok(Some(current)) if current.status == JobStatus::Cancelled => {
                Some(self.finish_cancelled(job, run).await)
            }
            Ok(_) => Some(Err(IngestError::Interrupted)),
            Err(e) => Some(Err(e.into())),
        }
    }

    /// The job left `processing` while Finalizing ran
    async fn finish_not_completed(
        &self,
        job: &IngestionJob,
        run: &mut Run,
    ) -> IngestResult<IngestOutcome> {
        let current = self
            .store
            .get_job(job.id)
            .await?
            .ok_or(IngestError::JobNotFound(job.id))?;
        if current.status == JobStatus::Cancelled {
            return self.finish_cancelled(job, run).await;
        }
        Err(IngestError::InvalidStatus {
            job_id: job.id,
            status: current.status,
            action: "completed",
        })
    }

    async fn finish_cancelled(
        &self,
        job: &IngestionJob,
        run: &mut Run,
    ) -> IngestResult<IngestOutcome> {
        run.stats.cancelled = true;
        run.stats.complete();
        let stats = run.stats.to_json();

        let mut total_rows = 0;
        if let Some(dataset_id) = run.dataset_id {
            total_rows = self.store.count_rows(dataset_id).await?;
            self.store
                .finalize_dataset(dataset_id, DatasetStatus::Failed, total_rows, &stats)
                .await?;
        }
        self.flush_issues(job.id).await;
        self.store.cancel_job(job.id, Some(&stats)).await?;

        info!(job_id = %job.id, rows_kept = total_rows, "CSV ingestion cancelled");
        Ok(IngestOutcome {
            job_id: job.id,
            status: JobStatus::Cancelled,
            dataset_id: run.dataset_id,
            total_rows,
            issues_logged: run.stats.issues_logged,
        })
    }

    async fn record_failure(&self, job: &IngestionJob, dataset_id: Option<Uuid>, err: &IngestError) {
        let message = err.to_string();
        error!(job_id = %job.id, code = err.code(), error = %message, "CSV ingestion failed");

        if let Err(e) = self.store.fail_job(job.id, &message).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
        }
        if let Some(dataset_id) = dataset_id {
            if let Err(e) = self.store.fail_dataset(dataset_id, &message).await {
                error!(dataset_id = %dataset_id, error = %e, "Failed to mark dataset as failed");
            }
            let scope = IssueScope::new(dataset_id, Some(job.id));
            if let Err(e) = self
                .issues
                .log_system_error(&scope, &message, Some(err.code()))
                .await
            {
                warn!(dataset_id = %dataset_id, error = %e, "Failed to record system issue");
            }
        }
        self.flush_issues(job.id).await;
    }

    async fn flush_issues(&self, job_id: Uuid) {
        match self.issues.flush().await {
            Ok(written) => debug!(job_id = %job_id, written, "Issues flushed"),
            // still buffered; the logger retries on its next tick
            Err(e) => warn!(job_id = %job_id, error = %e, "Issue flush failed"),
        }
    }

    async fn publish(&self, ctx: &JobContext, job_id: Uuid, progress: ProgressPayload) {
        if let Err(e) = self.store.update_job_progress(job_id, &progress).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist progress");
        }
        ctx.report_progress(progress).await;
    }
}

#[async_trait]
impl JobProcessor for CsvIngestionWorker {
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value> {
        let payload: CsvIngestJob =
            serde_json::from_value(ctx.job().payload.clone()).map_err(IngestError::Payload)?;
        let outcome = self.run_job(&ctx, payload.job_id).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}
