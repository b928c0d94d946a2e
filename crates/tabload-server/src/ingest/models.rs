//! Persistent records of the ingestion pipeline
//!
//! These map one-to-one onto the `ingestion_jobs`, `datasets`, `dataset_rows`
//! and `data_issues` tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tabload_common::types::FieldInfo;
use uuid::Uuid;

/// Longest cell value kept on an issue record, in characters
pub const MAX_CELL_VALUE_CHARS: usize = 200;

// ============================================================================
// Jobs
// ============================================================================

/// Ingestion job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled jobs never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(other.to_string()),
        }
    }
}

/// Parsing options supplied with an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOptions {
    pub has_headers: bool,
    pub delimiter: char,
    pub encoding: String,
    /// Drop rows whose cells are all blank, such as `,,`. Lines with no
    /// characters at all are never rows and are skipped either way.
    pub skip_empty_lines: bool,
    pub max_rows: Option<u64>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            has_headers: true,
            delimiter: ',',
            encoding: "utf-8".to_string(),
            skip_empty_lines: true,
            max_rows: None,
        }
    }
}

/// Reference to an uploaded file handed over by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub declared_size: i64,
    pub mime_type: Option<String>,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, declared_size: i64) -> Self {
        Self {
            path: path.into(),
            declared_size,
            mime_type: None,
        }
    }

    /// Dataset name derived from the file stem
    pub fn dataset_name(&self) -> String {
        Path::new(&self.path)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone())
    }
}

/// Ingestion job (maps to ingestion_jobs table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: Uuid,
    pub source: SourceFile,
    pub options: IngestOptions,
    pub status: JobStatus,
    pub progress_percentage: f64,
    pub current_step: Option<String>,
    pub rows_processed: i64,
    pub total_rows_estimated: Option<i64>,
    pub processing_speed: Option<f64>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub dataset_id: Option<Uuid>,
    pub processing_stats: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IngestionJob {
    /// New pending job for an uploaded file
    pub fn new(source: SourceFile, options: IngestOptions, max_retries: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source,
            options,
            status: JobStatus::Pending,
            progress_percentage: 0.0,
            current_step: None,
            rows_processed: 0,
            total_rows_estimated: None,
            processing_speed: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            dataset_id: None,
            processing_stats: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }
}

// ============================================================================
// Datasets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Processing,
    Active,
    Failed,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Processing => "processing",
            DatasetStatus::Active => "active",
            DatasetStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(DatasetStatus::Processing),
            "active" => Ok(DatasetStatus::Active),
            "failed" => Ok(DatasetStatus::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// Dataset (maps to datasets table); one per job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub total_rows: i64,
    pub total_columns: i32,
    pub column_schema: Vec<FieldInfo>,
    pub status: DatasetStatus,
    pub processing_stats: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dataset {
    pub fn new(job_id: Uuid, name: impl Into<String>, column_schema: Vec<FieldInfo>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            name: name.into(),
            total_rows: 0,
            total_columns: i32::try_from(column_schema.len()).unwrap_or(i32::MAX),
            column_schema,
            status: DatasetStatus::Processing,
            processing_stats: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One persisted data row, keyed by (dataset_id, row_index)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub dataset_id: Uuid,
    pub row_index: i64,
    /// JSON object whose key order follows the column schema
    pub data: serde_json::Value,
    pub content_hash: String,
}

// ============================================================================
// Issues
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Error => "error",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Info => "info",
        }
    }
}

impl std::str::FromStr for IssueSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(IssueSeverity::Error),
            "warning" => Ok(IssueSeverity::Warning),
            "info" => Ok(IssueSeverity::Info),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    DataValidation,
    TypeMismatch,
    MissingValue,
    ParsingError,
    SystemError,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::DataValidation => "data_validation",
            IssueCategory::TypeMismatch => "type_mismatch",
            IssueCategory::MissingValue => "missing_value",
            IssueCategory::ParsingError => "parsing_error",
            IssueCategory::SystemError => "system_error",
        }
    }

    /// Stable code stored with every issue of this category
    pub fn code(&self) -> &'static str {
        match self {
            IssueCategory::DataValidation => "VALIDATION_ERROR",
            IssueCategory::TypeMismatch => "TYPE_MISMATCH",
            IssueCategory::MissingValue => "MISSING_VALUE",
            IssueCategory::ParsingError => "PARSING_ERROR",
            IssueCategory::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl std::str::FromStr for IssueCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_validation" => Ok(IssueCategory::DataValidation),
            "type_mismatch" => Ok(IssueCategory::TypeMismatch),
            "missing_value" => Ok(IssueCategory::MissingValue),
            "parsing_error" => Ok(IssueCategory::ParsingError),
            "system_error" => Ok(IssueCategory::SystemError),
            other => Err(other.to_string()),
        }
    }
}

/// Issue waiting to be written (maps to data_issues table minus its id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIssue {
    pub dataset_id: Uuid,
    pub job_id: Option<Uuid>,
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    pub row_number: Option<i64>,
    pub column_name: Option<String>,
    pub cell_value: Option<String>,
    pub message: String,
    pub code: String,
    pub details: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl NewIssue {
    pub fn new(
        dataset_id: Uuid,
        severity: IssueSeverity,
        category: IssueCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            dataset_id,
            job_id: None,
            severity,
            category,
            row_number: None,
            column_name: None,
            cell_value: None,
            message: message.into(),
            code: category.code().to_string(),
            details: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_job(mut self, job_id: Option<Uuid>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn at_row(mut self, row_number: i64) -> Self {
        self.row_number = Some(row_number);
        self
    }

    pub fn in_column(mut self, column: impl Into<String>) -> Self {
        self.column_name = Some(column.into());
        self
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.cell_value = Some(truncate_cell_value(value));
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Stored issue with its sequence id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: i64,
    #[serde(flatten)]
    pub issue: NewIssue,
}

/// Issue counts for one dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub total: i64,
    pub by_severity: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
}

impl IssueSummary {
    pub fn add(&mut self, severity: IssueSeverity, category: IssueCategory, count: i64) {
        self.total += count;
        *self.by_severity.entry(severity.as_str().to_string()).or_default() += count;
        *self.by_category.entry(category.as_str().to_string()).or_default() += count;
    }

    pub fn count_for(&self, category: IssueCategory) -> i64 {
        self.by_category.get(category.as_str()).copied().unwrap_or(0)
    }
}

/// Filters for the paged issue listing; rows are 1-based and inclusive
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueFilter {
    pub severity: Option<IssueSeverity>,
    pub category: Option<IssueCategory>,
    pub column_name: Option<String>,
    pub row_from: Option<i64>,
    pub row_to: Option<i64>,
}

impl IssueFilter {
    pub fn matches(&self, issue: &NewIssue) -> bool {
        self.severity.is_none_or(|s| s == issue.severity)
            && self.category.is_none_or(|c| c == issue.category)
            && self
                .column_name
                .as_ref()
                .is_none_or(|c| issue.column_name.as_ref() == Some(c))
            && self
                .row_from
                .is_none_or(|from| issue.row_number.is_some_and(|r| r >= from))
            && self
                .row_to
                .is_none_or(|to| issue.row_number.is_some_and(|r| r <= to))
    }
}

/// Cut a cell value down to [`MAX_CELL_VALUE_CHARS`] characters
pub fn truncate_cell_value(value: &str) -> String {
    if value.chars().count() <= MAX_CELL_VALUE_CHARS {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(MAX_CELL_VALUE_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}
