//! Common test utilities for Tabload server integration tests
//!
//! - [`Harness`]: queue, issue logger and ingestion service wired to an
//!   in-memory store, with a temporary directory for CSV fixtures
//! - [`ScriptedStore`]: store wrapper that can fail or hold back row inserts
//! - [`TestPostgres`]: PostgreSQL container with migrations applied (Docker)

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tabload_server::config::QueueConfig;
use tabload_server::error::{StoreError, StoreResult};
use tabload_server::ingest::{
    Dataset, DatasetRow, DatasetStatus, IngestConfig, IngestOptions, IngestionJob, IngestionService,
    IssueFilter, IssueLogger, IssueLoggerConfig, IssueRecord, IssueSummary, JobStatus, SourceFile,
};
use tabload_server::pagination::{Paginated, PaginationParams};
use tabload_server::queue::{JobQueueManager, ProgressPayload, QueueEvent};
use tabload_server::store::{IngestStore, MemoryStore};
use tempfile::TempDir;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::{broadcast, Semaphore};
use uuid::Uuid;

/// Upper bound for any single wait in these tests
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Initialize tracing for tests
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tabload_server=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_queue_config() -> QueueConfig {
    QueueConfig {
        poll_interval_ms: 10,
        ..QueueConfig::default()
    }
}

/// Small batches so every fixture spans several of them
pub fn test_ingest_config() -> IngestConfig {
    IngestConfig {
        concurrency: 2,
        batch_size: 2,
        delete_source_on_success: false,
        issues: IssueLoggerConfig {
            buffer_size: 10,
            flush_interval_secs: 1,
            ..IssueLoggerConfig::default()
        },
        ..IngestConfig::default()
    }
}

// ============================================================================
// Pipeline harness
// ============================================================================

pub struct Harness {
    pub memory: Arc<MemoryStore>,
    pub queue: Arc<JobQueueManager>,
    pub issues: IssueLogger,
    pub service: IngestionService,
    pub dir: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_config(test_ingest_config()).await
    }

    pub async fn with_config(config: IngestConfig) -> Self {
        let memory = Arc::new(MemoryStore::new());
        Self::with_store(memory.clone(), memory, config).await
    }

    /// `store` is what the pipeline talks to; issues and the broker always
    /// go to `memory`
    pub async fn with_store(
        memory: Arc<MemoryStore>,
        store: Arc<dyn IngestStore>,
        config: IngestConfig,
    ) -> Self {
        init_test_tracing();

        let queue = Arc::new(
            JobQueueManager::connect(memory.clone(), test_queue_config())
                .await
                .expect("in-memory broker is always reachable"),
        );
        let issues = IssueLogger::start(memory.clone(), config.issues.clone());
        let service = IngestionService::new(store, queue.clone(), config);
        service
            .start_workers(issues.clone())
            .await
            .expect("Failed to start workers");

        Self {
            memory,
            queue,
            issues,
            service,
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Write a CSV fixture and describe it the way an uploader would
    pub fn write_csv(&self, name: &str, contents: &str) -> SourceFile {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("Failed to write fixture");
        let mut source = SourceFile::new(path.to_string_lossy(), contents.len() as i64);
        source.mime_type = Some("text/csv".to_string());
        source
    }

    pub async fn submit_and_wait(&self, source: SourceFile, options: IngestOptions) -> IngestionJob {
        let mut events = self.queue.subscribe();
        let job = self
            .service
            .submit(source, options)
            .await
            .expect("Failed to submit job");
        wait_for_terminal(&mut events, &job.id.to_string()).await;
        self.service.get_job(job.id).await.expect("job exists")
    }

    pub async fn shutdown(self) {
        self.queue.close().await;
        let _ = self.issues.close().await;
    }
}

/// Collect the events of `job_id` up to and including its terminal event
pub async fn wait_for_terminal(
    events: &mut broadcast::Receiver<QueueEvent>,
    job_id: &str,
) -> Vec<QueueEvent> {
    let collect = async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) if event.job_id == job_id => {
                    let done = event.kind.is_terminal();
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return seen,
            }
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, collect)
        .await
        .expect("timed out waiting for the job to finish")
}

/// Wait for the first progress event of `job_id` matching `predicate`
pub async fn wait_for_progress<F>(
    events: &mut broadcast::Receiver<QueueEvent>,
    job_id: &str,
    predicate: F,
) -> ProgressPayload
where
    F: Fn(&ProgressPayload) -> bool,
{
    use tabload_server::queue::QueueEventKind;

    let find = async {
        loop {
            if let Ok(event) = events.recv().await {
                if event.job_id != job_id {
                    continue;
                }
                if let QueueEventKind::Progress(progress) = event.kind {
                    if predicate(&progress) {
                        return progress;
                    }
                }
            }
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, find)
        .await
        .expect("timed out waiting for progress")
}

/// `rows` data rows of `id,name,price`
pub fn products_csv(rows: usize) -> String {
    let mut csv = String::from("id,name,price\n");
    for i in 1..=rows {
        csv.push_str(&format!("{i},product-{i},{}.50\n", i % 90 + 1));
    }
    csv
}

// ============================================================================
// Scripted store
// ============================================================================

/// Delegates to a [`MemoryStore`] but can fail or gate `insert_rows`, cancel
/// a job while its dataset is activated and run discovery on job creation
pub struct ScriptedStore {
    pub inner: Arc<MemoryStore>,
    /// 1-based insert call from which inserts fail, while `failing` is set
    fail_from_call: usize,
    failing: AtomicBool,
    insert_calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    cancel_on_activate: bool,
    discovery: OnceLock<IngestionService>,
}

impl ScriptedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_from_call: usize::MAX,
            failing: AtomicBool::new(false),
            insert_calls: AtomicUsize::new(0),
            gate: None,
            cancel_on_activate: false,
            discovery: OnceLock::new(),
        }
    }

    pub fn failing_from(mut self, call: usize) -> Self {
        self.fail_from_call = call;
        self.failing = AtomicBool::new(true);
        self
    }

    /// Every insert takes one permit from `gate`
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Cancel the owning job when its dataset is finalized `active`
    pub fn cancelling_on_activate(mut self) -> Self {
        self.cancel_on_activate = true;
        self
    }

    /// Run `service.enqueue_pending` right after every job record is created
    pub fn discover_on_create(&self, service: IngestionService) {
        let _ = self.discovery.set(service);
    }

    pub fn stop_failing(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IngestStore for ScriptedStore {
    async fn create_job(&self, job: &IngestionJob) -> StoreResult<()> {
        self.inner.create_job(job).await?;
        if let Some(service) = self.discovery.get() {
            service
                .enqueue_pending(10)
                .await
                .expect("discovery during create");
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<IngestionJob>> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, statuses: &[JobStatus], limit: i64) -> StoreResult<Vec<IngestionJob>> {
        self.inner.list_jobs(statuses, limit).await
    }

    async fn mark_job_processing(&self, id: Uuid) -> StoreResult<()> {
        self.inner.mark_job_processing(id).await
    }

    async fn update_job_progress(&self, id: Uuid, progress: &ProgressPayload) -> StoreResult<()> {
        self.inner.update_job_progress(id, progress).await
    }

    async fn set_job_dataset(&self, id: Uuid, dataset_id: Uuid) -> StoreResult<()> {
        self.inner.set_job_dataset(id, dataset_id).await
    }

    async fn complete_job(&self, id: Uuid, stats: &serde_json::Value) -> StoreResult<bool> {
        self.inner.complete_job(id, stats).await
    }

    async fn fail_job(&self, id: Uuid, message: &str) -> StoreResult<()> {
        self.inner.fail_job(id, message).await
    }

    async fn cancel_job(&self, id: Uuid, stats: Option<&serde_json::Value>) -> StoreResult<()> {
        self.inner.cancel_job(id, stats).await
    }

    async fn reset_job_for_retry(&self, id: Uuid) -> StoreResult<bool> {
        self.inner.reset_job_for_retry(id).await
    }

    async fn upsert_dataset(&self, dataset: &Dataset) -> StoreResult<Uuid> {
        self.inner.upsert_dataset(dataset).await
    }

    async fn get_dataset(&self, id: Uuid) -> StoreResult<Option<Dataset>> {
        self.inner.get_dataset(id).await
    }

    async fn get_dataset_by_job(&self, job_id: Uuid) -> StoreResult<Option<Dataset>> {
        self.inner.get_dataset_by_job(job_id).await
    }

    async fn finalize_dataset(
        &self,
        id: Uuid,
        status: DatasetStatus,
        total_rows: i64,
        stats: &serde_json::Value,
    ) -> StoreResult<()> {
        self.inner.finalize_dataset(id, status, total_rows, stats).await?;
        if self.cancel_on_activate && status == DatasetStatus::Active {
            if let Some(dataset) = self.inner.get_dataset(id).await? {
                self.inner.cancel_job(dataset.job_id, None).await?;
            }
        }
        Ok(())
    }

    async fn fail_dataset(&self, id: Uuid, message: &str) -> StoreResult<()> {
        self.inner.fail_dataset(id, message).await
    }

    async fn insert_rows(&self, rows: &[DatasetRow]) -> StoreResult<u64> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if self.failing.load(Ordering::SeqCst) && call >= self.fail_from_call {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.insert_rows(rows).await
    }

    async fn count_rows(&self, dataset_id: Uuid) -> StoreResult<i64> {
        self.inner.count_rows(dataset_id).await
    }

    async fn list_rows(
        &self,
        dataset_id: Uuid,
        page: &PaginationParams,
    ) -> StoreResult<Paginated<DatasetRow>> {
        self.inner.list_rows(dataset_id, page).await
    }

    async fn issue_summary(&self, dataset_id: Uuid) -> StoreResult<IssueSummary> {
        self.inner.issue_summary(dataset_id).await
    }

    async fn list_issues(
        &self,
        dataset_id: Uuid,
        filter: &IssueFilter,
        page: &PaginationParams,
    ) -> StoreResult<Paginated<IssueRecord>> {
        self.inner.list_issues(dataset_id, filter, page).await
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations applied; dropped with the test
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
