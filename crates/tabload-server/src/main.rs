//! Tabload Server - Main entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tabload_common::logging::{init_logging, LogConfig};
use tabload_server::config::Config;
use tabload_server::ingest::{
    IngestOptions, IngestionService, IssueLogger, IssueSink, SourceFile, CSV_INGESTION_QUEUE,
};
use tabload_server::queue::{Broker, JobQueueManager, QueueEvent, QueueEventKind};
use tabload_server::store::{IngestStore, MemoryStore, PgStore};

/// Jobs picked up per discovery scan
const DISCOVERY_BATCH: i64 = 500;

/// Tabload - asynchronous CSV ingestion
#[derive(Parser, Debug)]
#[command(name = "tabload-server")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ingestion workers, picking up pending jobs from the database
    Serve,

    /// Ingest a single CSV file and wait for the result
    Ingest(IngestArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// CSV file to ingest
    path: PathBuf,

    /// Treat the first line as data
    #[arg(long)]
    no_headers: bool,

    /// Field delimiter
    #[arg(short, long, default_value_t = ',')]
    delimiter: char,

    /// Character encoding (utf-8 or latin1)
    #[arg(short, long, default_value = "utf-8")]
    encoding: String,

    /// Keep rows whose cells are all blank (`,,`); zero-length lines are always skipped
    #[arg(long)]
    keep_empty_lines: bool,

    /// Stop after this many data rows
    #[arg(long)]
    max_rows: Option<u64>,

    /// MIME type reported by the uploader
    #[arg(long)]
    mime_type: Option<String>,

    /// Use an in-memory store instead of PostgreSQL
    #[arg(long)]
    memory: bool,

    /// Delete the file after a successful ingestion
    #[arg(long)]
    delete_source: bool,
}

impl IngestArgs {
    fn options(&self) -> IngestOptions {
        IngestOptions {
            has_headers: !self.no_headers,
            delimiter: self.delimiter,
            encoding: self.encoding.clone(),
            skip_empty_lines: !self.keep_empty_lines,
            max_rows: self.max_rows,
        }
    }
}

/// Store, queue and issue logger wired together
struct Runtime {
    service: IngestionService,
    queue: Arc<JobQueueManager>,
    issues: IssueLogger,
}

impl Runtime {
    async fn start<S>(store: Arc<S>, config: &Config) -> Result<Self>
    where
        S: IngestStore + IssueSink + Broker + 'static,
    {
        let queue = Arc::new(
            JobQueueManager::connect(store.clone(), config.queue.clone())
                .await
                .context("Failed to connect job queue")?,
        );
        let issues = IssueLogger::start(store.clone(), config.ingest.issues.clone());
        let service = IngestionService::new(store, queue.clone(), config.ingest.clone());
        service
            .start_workers(issues.clone())
            .await
            .context("Failed to start ingestion workers")?;

        Ok(Self {
            service,
            queue,
            issues,
        })
    }

    async fn shutdown(self) {
        self.queue.close().await;
        match self.issues.close().await {
            Ok(written) => debug!(written, "Issue logger closed"),
            Err(e) => warn!(error = %e, "Issue logger did not close cleanly"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("tabload-server")
        .filter_directives("tabload_server=debug,sqlx=warn")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let config = Config::load()?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Ingest(args) => ingest_file(config, args).await,
    }
}

async fn connect_store(config: &Config) -> Result<Arc<PgStore>> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;
    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    info!("Database migrations completed");

    Ok(Arc::new(PgStore::new(Arc::new(pool))))
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Tabload server");
    let store = connect_store(&config).await?;
    let runtime = Runtime::start(store, &config).await?;
    let shutdown = CancellationToken::new();

    let tasks = vec![
        spawn_event_logger(&runtime.queue, shutdown.clone()),
        spawn_cleaner(runtime.queue.clone(), &config, shutdown.clone()),
        spawn_discovery(runtime.service.clone(), &config, shutdown.clone()),
    ];
    info!(
        concurrency = config.ingest.concurrency,
        batch_size = config.ingest.batch_size,
        "Ingestion workers running"
    );

    shutdown_signal().await;
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    runtime.shutdown().await;

    info!("Server shut down gracefully");
    Ok(())
}

async fn ingest_file(mut config: Config, args: IngestArgs) -> Result<()> {
    config.ingest.delete_source_on_success = args.delete_source;

    let metadata = tokio::fs::metadata(&args.path)
        .await
        .with_context(|| format!("Cannot read {}", args.path.display()))?;
    let declared_size =
        i64::try_from(metadata.len()).context("File too large to describe")?;
    let mut source = SourceFile::new(args.path.to_string_lossy(), declared_size);
    source.mime_type = args.mime_type.clone();

    let runtime = if args.memory {
        Runtime::start(Arc::new(MemoryStore::new()), &config).await?
    } else {
        Runtime::start(connect_store(&config).await?, &config).await?
    };

    // subscribe before submitting so no event is missed
    let mut events = runtime.queue.subscribe();
    let job = runtime.service.submit(source, args.options()).await?;
    let queue_id = job.id.to_string();
    info!(job_id = %job.id, path = %args.path.display(), "Ingestion submitted");

    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            received = events.recv() => received,
            _ = shutdown_signal(), if !interrupted => {
                warn!(job_id = %job.id, "Interrupted, cancelling ingestion");
                interrupted = true;
                if let Err(e) = runtime.service.cancel_job(job.id).await {
                    // already finished; the terminal event is on its way
                    debug!(job_id = %job.id, error = %e, "Cancel request rejected");
                }
                // a job removed before it started publishes nothing further
                if runtime.queue.get_job(CSV_INGESTION_QUEUE, &queue_id).await?.is_none() {
                    break;
                }
                continue;
            }
        };
        match event {
            Ok(event) if event.job_id == queue_id => {
                log_event(&event);
                if event.kind.is_terminal() {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    let finished = runtime.service.get_job(job.id).await?;
    let dataset = runtime.service.get_dataset_for_job(job.id).await?;
    let summary = match &dataset {
        Some(dataset) => Some(runtime.service.issue_summary(dataset.id).await?),
        None => None,
    };
    runtime.shutdown().await;

    let report = serde_json::json!({
        "job": finished,
        "dataset": dataset,
        "issues": summary,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(message) = finished.error_message {
        anyhow::bail!("Ingestion failed: {message}");
    }
    Ok(())
}

fn log_event(event: &QueueEvent) {
    match &event.kind {
        QueueEventKind::Progress(progress) => info!(
            job_id = %event.job_id,
            step = %progress.current_step,
            percentage = progress.percentage,
            processed_rows = progress.processed_rows,
            "Progress"
        ),
        QueueEventKind::Failed { error } => {
            warn!(job_id = %event.job_id, queue = %event.queue_name, error = %error, "Job failed")
        }
        QueueEventKind::Stalled => {
            error!(job_id = %event.job_id, queue = %event.queue_name, "Job stalled")
        }
        kind => info!(
            job_id = %event.job_id,
            queue = %event.queue_name,
            event = kind.event_type(),
            "Job event"
        ),
    }
}

fn spawn_event_logger(queue: &JobQueueManager, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut events = queue.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event logger lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

fn spawn_cleaner(
    queue: Arc<JobQueueManager>,
    config: &Config,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let grace = config.queue.clean_grace();
    let limit = config.queue.clean_limit;
    let mut ticker = tokio::time::interval(config.queue.clean_interval());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match queue.clean_queue(CSV_INGESTION_QUEUE, grace, limit).await {
                        Ok(removed) if !removed.is_empty() => {
                            info!(removed = removed.len(), "Cleaned finished queue jobs");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Queue clean failed"),
                    }
                }
            }
        }
    })
}

fn spawn_discovery(
    service: IngestionService,
    config: &Config,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut ticker = tokio::time::interval(config.queue.discovery_interval());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = service.enqueue_pending(DISCOVERY_BATCH).await {
                        warn!(error = %e, code = e.code(), "Pending job discovery failed");
                    }
                }
            }
        }
    })
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
