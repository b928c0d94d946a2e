//! Batched issue logger
//!
//! [`IssueLogger`] is a cheap, cloneable handle. Issues travel over a bounded
//! channel to a single flush task that owns the buffer and writes it through an
//! [`IssueSink`] when it reaches `buffer_size`, on every `flush_interval`
//! tick, and on explicit [`flush`](IssueLogger::flush) or
//! [`close`](IssueLogger::close). A failed write puts the batch back in front
//! of the buffer, so delivery is at-least-once.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::IssueLoggerConfig;
use super::models::{IssueCategory, IssueSeverity, NewIssue};
use crate::error::StoreResult;
use tabload_common::types::FieldType;

/// Destination of flushed issues
#[async_trait]
pub trait IssueSink: Send + Sync {
    /// Write all issues in one bulk operation; returns rows written
    async fn write_issues(&self, issues: &[NewIssue]) -> StoreResult<u64>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IssueLogError {
    #[error("Issue logger is closed")]
    Closed,

    #[error("Issue write failed: {0}")]
    Sink(String),
}

enum Command {
    Log(Vec<NewIssue>),
    Flush(oneshot::Sender<Result<usize, IssueLogError>>),
    Close(oneshot::Sender<Result<usize, IssueLogError>>),
}

/// Dataset and job an issue belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueScope {
    pub dataset_id: Uuid,
    pub job_id: Option<Uuid>,
}

impl IssueScope {
    pub fn new(dataset_id: Uuid, job_id: Option<Uuid>) -> Self {
        Self { dataset_id, job_id }
    }

    fn issue(
        &self,
        severity: IssueSeverity,
        category: IssueCategory,
        message: impl Into<String>,
    ) -> NewIssue {
        NewIssue::new(self.dataset_id, severity, category, message).with_job(self.job_id)
    }
}

#[derive(Clone)]
pub struct IssueLogger {
    tx: mpsc::Sender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl IssueLogger {
    /// Spawn the flush task; must be called inside a tokio runtime
    pub fn start(sink: Arc<dyn IssueSink>, config: IssueLoggerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let task = tokio::spawn(run_flush_loop(rx, sink, config));

        Self {
            tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub async fn log_issue(&self, issue: NewIssue) -> Result<(), IssueLogError> {
        self.log_issues(vec![issue]).await
    }

    pub async fn log_issues(&self, issues: Vec<NewIssue>) -> Result<(), IssueLogError> {
        if issues.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Command::Log(issues))
            .await
            .map_err(|_| IssueLogError::Closed)
    }

    /// Write everything buffered so far; returns the number of issues written
    pub async fn flush(&self) -> Result<usize, IssueLogError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| IssueLogError::Closed)?;
        done.await.map_err(|_| IssueLogError::Closed)?
    }

    /// Final flush, then stop the flush task. Later calls return `Closed`.
    pub async fn close(&self) -> Result<usize, IssueLogError> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Close(ack)).await.is_err() {
            return Err(IssueLogError::Closed);
        }
        let result = done.await.map_err(|_| IssueLogError::Closed)?;

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Issue flush task ended abnormally");
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Helpers assigning the stable category codes
    // ------------------------------------------------------------------

    /// Empty cell; a warning for non-nullable columns, info otherwise
    pub async fn log_missing_value(
        &self,
        scope: &IssueScope,
        row_number: i64,
        column: &str,
        nullable: bool,
    ) -> Result<(), IssueLogError> {
        let severity = if nullable {
            IssueSeverity::Info
        } else {
            IssueSeverity::Warning
        };
        let issue = scope
            .issue(
                severity,
                IssueCategory::MissingValue,
                format!("Missing value in column '{column}'"),
            )
            .at_row(row_number)
            .in_column(column);
        self.log_issue(issue).await
    }

    pub async fn log_type_mismatch(
        &self,
        scope: &IssueScope,
        row_number: i64,
        column: &str,
        value: &str,
        expected: FieldType,
    ) -> Result<(), IssueLogError> {
        let issue = scope
            .issue(
                IssueSeverity::Warning,
                IssueCategory::TypeMismatch,
                format!("Expected {expected} in column '{column}'"),
            )
            .at_row(row_number)
            .in_column(column)
            .with_value(value)
            .with_details(serde_json::json!({ "expected_type": expected.as_str() }));
        self.log_issue(issue).await
    }

    pub async fn log_validation_error(
        &self,
        scope: &IssueScope,
        row_number: i64,
        column: &str,
        value: &str,
        message: &str,
    ) -> Result<(), IssueLogError> {
        let issue = scope
            .issue(IssueSeverity::Warning, IssueCategory::DataValidation, message)
            .at_row(row_number)
            .in_column(column)
            .with_value(value);
        self.log_issue(issue).await
    }

    pub async fn log_parsing_error(
        &self,
        scope: &IssueScope,
        row_number: Option<i64>,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> Result<(), IssueLogError> {
        let mut issue = scope.issue(IssueSeverity::Info, IssueCategory::ParsingError, message);
        issue.row_number = row_number;
        issue.details = details;
        self.log_issue(issue).await
    }

    pub async fn log_system_error(
        &self,
        scope: &IssueScope,
        message: &str,
        code: Option<&str>,
    ) -> Result<(), IssueLogError> {
        let mut issue = scope.issue(IssueSeverity::Error, IssueCategory::SystemError, message);
        if let Some(code) = code {
            issue = issue.with_details(serde_json::json!({ "error_code": code }));
        }
        self.log_issue(issue).await
    }
}

async fn run_flush_loop(
    mut rx: mpsc::Receiver<Command>,
    sink: Arc<dyn IssueSink>,
    config: IssueLoggerConfig,
) {
    let mut buffer: Vec<NewIssue> = Vec::new();
    let mut ticker = tokio::time::interval(config.flush_interval().max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Log(issues)) => {
                    buffer.extend(issues);
                    if buffer.len() >= config.buffer_size {
                        let _ = flush_buffer(&mut buffer, sink.as_ref(), &config).await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    let _ = ack.send(flush_buffer(&mut buffer, sink.as_ref(), &config).await);
                }
                Some(Command::Close(ack)) => {
                    let _ = ack.send(flush_buffer(&mut buffer, sink.as_ref(), &config).await);
                    break;
                }
                None => {
                    let _ = flush_buffer(&mut buffer, sink.as_ref(), &config).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    let _ = flush_buffer(&mut buffer, sink.as_ref(), &config).await;
                }
            }
        }
    }

    if !buffer.is_empty() {
        warn!(dropped = buffer.len(), "Issue logger stopped with unwritten issues");
    }
    debug!("Issue flush task stopped");
}

async fn flush_buffer(
    buffer: &mut Vec<NewIssue>,
    sink: &dyn IssueSink,
    config: &IssueLoggerConfig,
) -> Result<usize, IssueLogError> {
    if buffer.is_empty() {
        return Ok(0);
    }

    let batch = std::mem::take(buffer);
    match sink.write_issues(&batch).await {
        Ok(_) => {
            debug!(issues = batch.len(), "Issues flushed");
            Ok(batch.len())
        }
        Err(e) => {
            warn!(error = %e, pending = batch.len(), "Issue flush failed, keeping batch for the next attempt");
            let newer = std::mem::replace(buffer, batch);
            buffer.extend(newer);

            if buffer.len() > config.max_buffered {
                let overflow = buffer.len() - config.max_buffered;
                buffer.drain(..overflow);
                warn!(dropped = overflow, "Issue buffer full, oldest issues dropped");
            }
            Err(IssueLogError::Sink(e.to_string()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        written: std::sync::Mutex<Vec<NewIssue>>,
        writes: std::sync::atomic::AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl IssueSink for RecordingSink {
        async fn write_issues(&self, issues: &[NewIssue]) -> StoreResult<u64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::NotFound {
                    entity: "connection",
                    id: "down".into(),
                });
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.written.lock().unwrap().extend_from_slice(issues);
            Ok(issues.len() as u64)
        }
    }

    fn config(buffer_size: usize, flush_interval_secs: u64) -> IssueLoggerConfig {
        IssueLoggerConfig {
            buffer_size,
            flush_interval_secs,
            ..IssueLoggerConfig::default()
        }
    }

    fn scope() -> IssueScope {
        IssueScope::new(Uuid::new_v4(), Some(Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush() {
        let sink = Arc::new(RecordingSink::default());
        let logger = IssueLogger::start(sink.clone(), config(3, 3600));
        let scope = scope();

        for row in 1..=3 {
            logger.log_missing_value(&scope, row, "age", false).await.unwrap();
        }

        for _ in 0..100 {
            if sink.written.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.written.lock().unwrap().len(), 3);
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
        logger.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_reports_written_count() {
        let sink = Arc::new(RecordingSink::default());
        let logger = IssueLogger::start(sink.clone(), config(100, 3600));
        let scope = scope();

        logger
            .log_type_mismatch(&scope, 2, "price", "abc", FieldType::Number)
            .await
            .unwrap();
        logger
            .log_validation_error(&scope, 3, "email", "not-an-email", "Invalid email address")
            .await
            .unwrap();

        assert_eq!(logger.flush().await.unwrap(), 2);
        assert_eq!(logger.flush().await.unwrap(), 0);

        let written = sink.written.lock().unwrap().clone();
        assert_eq!(written[0].code, "TYPE_MISMATCH");
        assert_eq!(written[0].cell_value.as_deref(), Some("abc"));
        assert_eq!(written[1].code, "VALIDATION_ERROR");
        assert_eq!(written[1].job_id, scope.job_id);
        logger.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_flush_rebuffers() {
        let sink = Arc::new(RecordingSink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let logger = IssueLogger::start(sink.clone(), config(100, 3600));
        let scope = scope();

        logger.log_system_error(&scope, "disk full", None).await.unwrap();
        logger
            .log_parsing_error(&scope, Some(4), "Row has 5 cells, expected 4", None)
            .await
            .unwrap();

        assert!(matches!(logger.flush().await, Err(IssueLogError::Sink(_))));

        sink.failing.store(false, Ordering::SeqCst);
        assert_eq!(logger.flush().await.unwrap(), 2);

        let written = sink.written.lock().unwrap().clone();
        assert_eq!(written[0].category, IssueCategory::SystemError);
        assert_eq!(written[0].severity, IssueSeverity::Error);
        assert_eq!(written[1].code, "PARSING_ERROR");
        logger.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_value_severity_follows_nullability() {
        let sink = Arc::new(RecordingSink::default());
        let logger = IssueLogger::start(sink.clone(), config(100, 3600));
        let scope = scope();

        logger.log_missing_value(&scope, 1, "id", false).await.unwrap();
        logger.log_missing_value(&scope, 2, "age", true).await.unwrap();
        logger.flush().await.unwrap();

        let written = sink.written.lock().unwrap().clone();
        assert_eq!(written[0].severity, IssueSeverity::Warning);
        assert_eq!(written[1].severity, IssueSeverity::Info);
        assert!(written.iter().all(|i| i.code == "MISSING_VALUE"));
        logger.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects_later_logs() {
        let sink = Arc::new(RecordingSink::default());
        let logger = IssueLogger::start(sink.clone(), config(100, 3600));
        let scope = scope();

        logger.log_missing_value(&scope, 1, "age", true).await.unwrap();
        assert_eq!(logger.close().await.unwrap(), 1);

        assert_eq!(
            logger.log_missing_value(&scope, 2, "age", true).await,
            Err(IssueLogError::Closed)
        );
        assert_eq!(logger.close().await, Err(IssueLogError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_small_buffers() {
        let sink = Arc::new(RecordingSink::default());
        let logger = IssueLogger::start(sink.clone(), config(100, 5));
        let scope = scope();

        logger.log_missing_value(&scope, 1, "age", true).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(sink.written.lock().unwrap().len(), 1);
        logger.close().await.unwrap();
    }
}
