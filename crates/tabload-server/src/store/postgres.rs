//! PostgreSQL store
//!
//! All statements are parameterized and checked at runtime, so building the
//! crate does not need a live database. Multi-row writes use
//! `QueryBuilder::push_values` with `ON CONFLICT DO NOTHING`, which makes a
//! re-run of the same batch a no-op.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::IngestStore;
use crate::error::{StoreError, StoreResult};
use crate::ingest::issues::IssueSink;
use crate::ingest::models::{
    Dataset, DatasetRow, DatasetStatus, IngestOptions, IngestionJob, IssueFilter, IssueRecord,
    IssueSummary, JobStatus, NewIssue, SourceFile,
};
use crate::pagination::{Paginated, PaginationParams};
use crate::queue::{Broker, ProgressPayload};

/// Rows per INSERT statement (4 binds each, well under the 65535 bind limit)
const ROW_INSERT_CHUNK: usize = 5_000;

/// Issues per INSERT statement (11 binds each)
const ISSUE_INSERT_CHUNK: usize = 2_000;

const JOB_COLUMNS: &str = r#"
    id, source_file_path, declared_file_size, mime_type, options, status,
    progress_percentage, current_step, rows_processed, total_rows_estimated,
    processing_speed, retry_count, max_retries, error_message, dataset_id,
    processing_stats, created_at, updated_at, completed_at
"#;

const DATASET_COLUMNS: &str = r#"
    id, job_id, name, total_rows, total_columns, column_schema, status,
    processing_stats, error_message, created_at, updated_at
"#;

const ISSUE_COLUMNS: &str = r#"
    id, dataset_id, job_id, severity, category, row_number, column_name,
    cell_value, message, code, details, occurred_at
"#;

/// Store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode<T: std::str::FromStr>(field: &'static str, value: String) -> StoreResult<T> {
    value
        .parse()
        .map_err(|_| StoreError::Decode { field, value })
}

fn job_from_row(row: &PgRow) -> StoreResult<IngestionJob> {
    let options: serde_json::Value = row.try_get("options")?;
    let options: IngestOptions = serde_json::from_value(options)?;

    Ok(IngestionJob {
        id: row.try_get("id")?,
        source: SourceFile {
            path: row.try_get("source_file_path")?,
            declared_size: row.try_get("declared_file_size")?,
            mime_type: row.try_get("mime_type")?,
        },
        options,
        status: decode::<JobStatus>("ingestion_jobs.status", row.try_get("status")?)?,
        progress_percentage: row.try_get("progress_percentage")?,
        current_step: row.try_get("current_step")?,
        rows_processed: row.try_get("rows_processed")?,
        total_rows_estimated: row.try_get("total_rows_estimated")?,
        processing_speed: row.try_get("processing_speed")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        error_message: row.try_get("error_message")?,
        dataset_id: row.try_get("dataset_id")?,
        processing_stats: row.try_get("processing_stats")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn dataset_from_row(row: &PgRow) -> StoreResult<Dataset> {
    let schema: serde_json::Value = row.try_get("column_schema")?;

    Ok(Dataset {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        name: row.try_get("name")?,
        total_rows: row.try_get("total_rows")?,
        total_columns: row.try_get("total_columns")?,
        column_schema: tabload_common::types::schema_from_json(schema)?,
        status: decode::<DatasetStatus>("datasets.status", row.try_get("status")?)?,
        processing_stats: row.try_get("processing_stats")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn issue_from_row(row: &PgRow) -> StoreResult<IssueRecord> {
    Ok(IssueRecord {
        id: row.try_get("id")?,
        issue: NewIssue {
            dataset_id: row.try_get("dataset_id")?,
            job_id: row.try_get("job_id")?,
            severity: decode("data_issues.severity", row.try_get("severity")?)?,
            category: decode("data_issues.category", row.try_get("category")?)?,
            row_number: row.try_get("row_number")?,
            column_name: row.try_get("column_name")?,
            cell_value: row.try_get("cell_value")?,
            message: row.try_get("message")?,
            code: row.try_get("code")?,
            details: row.try_get("details")?,
            occurred_at: row.try_get("occurred_at")?,
        },
    })
}

fn push_issue_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    dataset_id: Uuid,
    filter: &IssueFilter,
) {
    builder.push(" WHERE dataset_id = ").push_bind(dataset_id);
    if let Some(severity) = filter.severity {
        builder.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(category) = filter.category {
        builder.push(" AND category = ").push_bind(category.as_str());
    }
    if let Some(column) = &filter.column_name {
        builder.push(" AND column_name = ").push_bind(column.clone());
    }
    if let Some(from) = filter.row_from {
        builder.push(" AND row_number >= ").push_bind(from);
    }
    if let Some(to) = filter.row_to {
        builder.push(" AND row_number <= ").push_bind(to);
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn create_job(&self, job: &IngestionJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_jobs (
                id, source_file_path, declared_file_size, mime_type, options, status,
                progress_percentage, rows_processed, retry_count, max_retries,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id)
        .bind(&job.source.path)
        .bind(job.source.declared_size)
        .bind(&job.source.mime_type)
        .bind(serde_json::to_value(&job.options)?)
        .bind(job.status.as_str())
        .bind(job.progress_percentage)
        .bind(job.rows_processed)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<IngestionJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, statuses: &[JobStatus], limit: i64) -> StoreResult<Vec<IngestionJob>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE status = ANY($1) ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(&statuses)
        .bind(limit.max(0))
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn mark_job_processing(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'cancelled')
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn update_job_progress(&self, id: Uuid, progress: &ProgressPayload) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET progress_percentage = GREATEST(progress_percentage, $2),
                current_step = $3,
                rows_processed = $4,
                total_rows_estimated = $5,
                processing_speed = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(progress.percentage)
        .bind(&progress.current_step)
        .bind(progress.processed_rows as i64)
        .bind(progress.total_rows.map(|t| t as i64))
        .bind(progress.processing_speed)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn set_job_dataset(&self, id: Uuid, dataset_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE ingestion_jobs SET dataset_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(dataset_id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    async fn complete_job(&self, id: Uuid, stats: &serde_json::Value) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'completed',
                progress_percentage = 100,
                processing_stats = $2,
                error_message = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(stats)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(&self, id: Uuid, message: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'failed',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_job(&self, id: Uuid, stats: Option<&serde_json::Value>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'cancelled',
                processing_stats = COALESCE($2, processing_stats),
                completed_at = COALESCE(completed_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(stats)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn reset_job_for_retry(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                error_message = NULL,
                completed_at = NULL,
                progress_percentage = 0,
                current_step = NULL,
                rows_processed = 0,
                processing_speed = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed' AND retry_count < max_retries
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_dataset(&self, dataset: &Dataset) -> StoreResult<Uuid> {
        let schema = tabload_common::types::schema_to_json(&dataset.column_schema)?;

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO datasets (
                id, job_id, name, total_rows, total_columns, column_schema, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, 0, $4, $5, 'processing', $6, $6)
            ON CONFLICT (job_id) DO UPDATE
            SET name = EXCLUDED.name,
                total_columns = EXCLUDED.total_columns,
                column_schema = EXCLUDED.column_schema,
                status = 'processing',
                error_message = NULL,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(dataset.id)
        .bind(dataset.job_id)
        .bind(&dataset.name)
        .bind(dataset.total_columns)
        .bind(schema)
        .bind(dataset.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    async fn get_dataset(&self, id: Uuid) -> StoreResult<Option<Dataset>> {
        let row = sqlx::query(&format!(
            "SELECT {DATASET_COLUMNS} FROM datasets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn get_dataset_by_job(&self, job_id: Uuid) -> StoreResult<Option<Dataset>> {
        let row = sqlx::query(&format!(
            "SELECT {DATASET_COLUMNS} FROM datasets WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn finalize_dataset(
        &self,
        id: Uuid,
        status: DatasetStatus,
        total_rows: i64,
        stats: &serde_json::Value,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE datasets
            SET status = $2, total_rows = $3, processing_stats = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(total_rows)
        .bind(stats)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "dataset",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn fail_dataset(&self, id: Uuid, message: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE datasets
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn insert_rows(&self, rows: &[DatasetRow]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(ROW_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO dataset_rows (dataset_id, row_index, data, content_hash) ",
            );
            builder.push_values(chunk, |mut b, row| {
                // sent as text so the json column keeps the schema's key order
                b.push_bind(row.dataset_id)
                    .push_bind(row.row_index)
                    .push_bind(row.data.to_string())
                    .push_unseparated("::json")
                    .push_bind(&row.content_hash);
            });
            builder.push(" ON CONFLICT (dataset_id, row_index) DO NOTHING");

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(rows = rows.len(), inserted, "Row batch written");
        Ok(inserted)
    }

    async fn count_rows(&self, dataset_id: Uuid) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dataset_rows WHERE dataset_id = $1")
                .bind(dataset_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count)
    }

    async fn list_rows(
        &self,
        dataset_id: Uuid,
        page: &PaginationParams,
    ) -> StoreResult<Paginated<DatasetRow>> {
        let total = self.count_rows(dataset_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT dataset_id, row_index, data, content_hash
            FROM dataset_rows
            WHERE dataset_id = $1
            ORDER BY row_index
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(dataset_id)
        .bind(page.per_page())
        .bind(page.offset())
        .fetch_all(&*self.pool)
        .await?;

        let items = rows
            .iter()
            .map(|row| {
                Ok(DatasetRow {
                    dataset_id: row.try_get("dataset_id")?,
                    row_index: row.try_get("row_index")?,
                    data: row.try_get("data")?,
                    content_hash: row.try_get("content_hash")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Paginated::new(items, page, total))
    }

    async fn issue_summary(&self, dataset_id: Uuid) -> StoreResult<IssueSummary> {
        let rows = sqlx::query(
            r#"
            SELECT severity, category, COUNT(*) AS count
            FROM data_issues
            WHERE dataset_id = $1
            GROUP BY severity, category
            "#,
        )
        .bind(dataset_id)
        .fetch_all(&*self.pool)
        .await?;

        let mut summary = IssueSummary::default();
        for row in &rows {
            summary.add(
                decode("data_issues.severity", row.try_get("severity")?)?,
                decode("data_issues.category", row.try_get("category")?)?,
                row.try_get("count")?,
            );
        }
        Ok(summary)
    }

    async fn list_issues(
        &self,
        dataset_id: Uuid,
        filter: &IssueFilter,
        page: &PaginationParams,
    ) -> StoreResult<Paginated<IssueRecord>> {
        let mut count_query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM data_issues");
        push_issue_filters(&mut count_query, dataset_id, filter);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await?;

        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {ISSUE_COLUMNS} FROM data_issues"));
        push_issue_filters(&mut query, dataset_id, filter);
        query
            .push(" ORDER BY row_number NULLS FIRST, id LIMIT ")
            .push_bind(page.per_page())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = query.build().fetch_all(&*self.pool).await?;
        let items = rows
            .iter()
            .map(issue_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Paginated::new(items, page, total))
    }
}

#[async_trait]
impl IssueSink for PgStore {
    async fn write_issues(&self, issues: &[NewIssue]) -> StoreResult<u64> {
        let mut written = 0;

        for chunk in issues.chunks(ISSUE_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                INSERT INTO data_issues (
                    dataset_id, job_id, severity, category, row_number, column_name,
                    cell_value, message, code, details, occurred_at
                )
                "#,
            );
            builder.push_values(chunk, |mut b, issue| {
                b.push_bind(issue.dataset_id)
                    .push_bind(issue.job_id)
                    .push_bind(issue.severity.as_str())
                    .push_bind(issue.category.as_str())
                    .push_bind(issue.row_number)
                    .push_bind(&issue.column_name)
                    .push_bind(&issue.cell_value)
                    .push_bind(&issue.message)
                    .push_bind(&issue.code)
                    .push_bind(&issue.details)
                    .push_bind(issue.occurred_at);
            });

            written += builder.build().execute(&*self.pool).await?.rows_affected();
        }

        Ok(written)
    }
}

#[async_trait]
impl Broker for PgStore {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }
}
