//! Column schema inference
//!
//! A single streaming pass over the file: every row is counted, but only the
//! first `sample_size` data rows feed the per-column type sets, so memory is
//! bounded by columns x sample size regardless of file length.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use super::models::IngestOptions;
use super::reader::CsvRowReader;
use crate::error::IngestResult;
use tabload_common::types::{FieldInfo, FieldType};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

pub fn is_date(value: &str) -> bool {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
        || DATETIME_FORMATS
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(value, fmt).is_ok())
        || DateTime::parse_from_rfc3339(value).is_ok()
}

/// Finite numbers only; `inf` and `NaN` are text
pub fn is_number(value: &str) -> bool {
    value
        .trim()
        .parse::<f64>()
        .map(f64::is_finite)
        .unwrap_or(false)
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

/// Most specific type a non-empty value parses as
pub fn detect_type(value: &str) -> Option<FieldType> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else if is_date(value) {
        Some(FieldType::Date)
    } else if is_number(value) {
        Some(FieldType::Number)
    } else if parse_boolean(value).is_some() {
        Some(FieldType::Boolean)
    } else {
        Some(FieldType::String)
    }
}

/// Column names for `width` columns: header text where present, `Column_N`
/// otherwise, with `_2`, `_3`... appended to repeated names
pub fn canonical_column_names(header: Option<&[String]>, width: usize) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(width);
    let mut names = Vec::with_capacity(width);

    for i in 0..width {
        let base = header
            .and_then(|h| h.get(i))
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Column_{}", i + 1));

        let mut name = base.clone();
        let mut suffix = 1;
        while taken.contains(&name) {
            suffix += 1;
            name = format!("{base}_{suffix}");
        }
        taken.insert(name.clone());
        names.push(name);
    }

    names
}

#[derive(Debug, Default)]
struct ColumnStats {
    types: HashSet<FieldType>,
    nullable: bool,
    non_null: usize,
    samples: Vec<String>,
}

impl ColumnStats {
    fn resolve(&self) -> FieldType {
        let Some(best) = self.types.iter().copied().max_by_key(FieldType::specificity) else {
            return FieldType::String;
        };
        if self.types.iter().all(|t| *t == best) {
            best
        } else {
            FieldType::String
        }
    }
}

/// Result of the structural pass
#[derive(Debug, Clone, PartialEq)]
pub struct StructureAnalysis {
    pub column_schema: Vec<FieldInfo>,
    pub total_rows: u64,
    pub sampled_rows: usize,
    /// Header width, when the file has a header row
    pub header_width: Option<usize>,
}

pub struct SchemaInferrer {
    header: Option<Vec<String>>,
    sample_size: usize,
    sample_values: usize,
    columns: Vec<ColumnStats>,
    sampled_rows: usize,
    total_rows: u64,
    max_width: usize,
}

impl SchemaInferrer {
    pub fn new(header: Option<Vec<String>>, sample_size: usize, sample_values: usize) -> Self {
        Self {
            header,
            sample_size,
            sample_values,
            columns: Vec::new(),
            sampled_rows: 0,
            total_rows: 0,
            max_width: 0,
        }
    }

    pub fn observe(&mut self, cells: &[String]) {
        self.total_rows += 1;
        self.max_width = self.max_width.max(cells.len());
        if self.sampled_rows >= self.sample_size {
            return;
        }

        // a column first seen now was missing from every earlier sampled row
        while self.columns.len() < cells.len() {
            self.columns.push(ColumnStats {
                nullable: self.sampled_rows > 0,
                ..Default::default()
            });
        }

        for (i, column) in self.columns.iter_mut().enumerate() {
            let value = cells.get(i).map(|c| c.trim()).unwrap_or("");
            let Some(field_type) = detect_type(value) else {
                column.nullable = true;
                continue;
            };
            column.types.insert(field_type);
            column.non_null += 1;
            if column.samples.len() < self.sample_values
                && !column.samples.iter().any(|s| s == value)
            {
                column.samples.push(value.to_string());
            }
        }
        self.sampled_rows += 1;
    }

    pub fn finish(self) -> StructureAnalysis {
        let header_width = self.header.as_ref().map(Vec::len);
        let width = header_width.unwrap_or(0).max(self.max_width);
        let names = canonical_column_names(self.header.as_deref(), width);

        let column_schema = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| match self.columns.get(i) {
                Some(stats) if stats.non_null > 0 => FieldInfo {
                    name,
                    field_type: stats.resolve(),
                    nullable: stats.nullable,
                    sample_values: stats.samples.clone(),
                },
                _ => FieldInfo::new(name, FieldType::String, true),
            })
            .collect();

        StructureAnalysis {
            column_schema,
            total_rows: self.total_rows,
            sampled_rows: self.sampled_rows,
            header_width,
        }
    }
}

/// Stream the whole file once, inferring the schema and counting rows
pub async fn analyze_structure(
    path: &Path,
    options: &IngestOptions,
    sample_size: usize,
    sample_values: usize,
) -> IngestResult<StructureAnalysis> {
    let mut reader = CsvRowReader::open(path, options).await?;
    let header = reader.headers().map(<[String]>::to_vec);
    let mut inferrer = SchemaInferrer::new(header, sample_size, sample_values);

    while let Some(row) = reader.next_row().await? {
        inferrer.observe(&row.cells);
    }

    let analysis = inferrer.finish();
    debug!(
        path = %path.display(),
        columns = analysis.column_schema.len(),
        total_rows = analysis.total_rows,
        sampled_rows = analysis.sampled_rows,
        "Structure analysis finished"
    );
    Ok(analysis)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_detect_type() {
        assert_eq!(detect_type("2024-01-15"), Some(FieldType::Date));
        assert_eq!(detect_type("01/15/2024"), Some(FieldType::Date));
        assert_eq!(detect_type("15.01.2024"), Some(FieldType::Date));
        assert_eq!(detect_type("2024-01-15T10:30:00"), Some(FieldType::Date));
        assert_eq!(detect_type("2024-01-15T10:30:00+02:00"), Some(FieldType::Date));
        assert_eq!(detect_type("42"), Some(FieldType::Number));
        assert_eq!(detect_type(" -3.5e2 "), Some(FieldType::Number));
        assert_eq!(detect_type("YES"), Some(FieldType::Boolean));
        assert_eq!(detect_type("false"), Some(FieldType::Boolean));
        assert_eq!(detect_type("NaN"), Some(FieldType::String));
        assert_eq!(detect_type("inf"), Some(FieldType::String));
        assert_eq!(detect_type("2024-13-45"), Some(FieldType::String));
        assert_eq!(detect_type("   "), None);
    }

    #[test]
    fn test_canonical_column_names() {
        let header = cells(&["id", "", "name", "name", " id "]);
        assert_eq!(
            canonical_column_names(Some(&header), 6),
            vec!["id", "Column_2", "name", "name_2", "id_2", "Column_6"]
        );
        assert_eq!(canonical_column_names(None, 2), vec!["Column_1", "Column_2"]);
    }

    #[test]
    fn test_infers_types_from_sample() {
        let mut inferrer =
            SchemaInferrer::new(Some(cells(&["id", "name", "price", "email"])), 1000, 5);
        inferrer.observe(&cells(&["1", "Widget", "9.99", "a@example.com"]));
        inferrer.observe(&cells(&["2", "", "abc", "bad-email"]));
        inferrer.observe(&cells(&["3", "Gadget", "4.50", "c@example.com"]));
        let analysis = inferrer.finish();

        let types: Vec<FieldType> = analysis
            .column_schema
            .iter()
            .map(|f| f.field_type)
            .collect();
        assert_eq!(
            types,
            vec![
                FieldType::Number,
                FieldType::String,
                FieldType::String,
                FieldType::String
            ]
        );
        assert_eq!(analysis.total_rows, 3);
        assert!(!analysis.column_schema[0].nullable);
        assert!(analysis.column_schema[1].nullable);
        assert_eq!(analysis.column_schema[1].sample_values, vec!["Widget", "Gadget"]);
        assert_eq!(analysis.header_width, Some(4));
    }

    #[test]
    fn test_sample_window_bounds_inference_but_not_counting() {
        let mut inferrer = SchemaInferrer::new(Some(cells(&["a"])), 2, 5);
        inferrer.observe(&cells(&["1"]));
        inferrer.observe(&cells(&["2"]));
        inferrer.observe(&cells(&["text", "late"]));
        let analysis = inferrer.finish();

        assert_eq!(analysis.total_rows, 3);
        assert_eq!(analysis.sampled_rows, 2);
        assert_eq!(analysis.column_schema[0].field_type, FieldType::Number);
        let late = &analysis.column_schema[1];
        assert_eq!(late.name, "Column_2");
        assert_eq!(late.field_type, FieldType::String);
        assert!(late.nullable);
    }

    #[test]
    fn test_all_empty_column_is_nullable_string() {
        let mut inferrer = SchemaInferrer::new(Some(cells(&["a", "b"])), 10, 5);
        inferrer.observe(&cells(&["1", ""]));
        inferrer.observe(&cells(&["2"]));
        let analysis = inferrer.finish();

        assert_eq!(analysis.column_schema[1].field_type, FieldType::String);
        assert!(analysis.column_schema[1].nullable);
    }

    #[test]
    fn test_late_appearing_column_within_sample_is_nullable() {
        let mut inferrer = SchemaInferrer::new(None, 10, 5);
        inferrer.observe(&cells(&["1"]));
        inferrer.observe(&cells(&["2", "true"]));
        let analysis = inferrer.finish();

        assert_eq!(analysis.column_schema.len(), 2);
        assert_eq!(analysis.column_schema[1].field_type, FieldType::Boolean);
        assert!(analysis.column_schema[1].nullable);
        assert_eq!(analysis.header_width, None);
    }

    #[test]
    fn test_mixed_types_collapse_to_string() {
        let mut inferrer = SchemaInferrer::new(None, 10, 5);
        inferrer.observe(&cells(&["2024-01-01"]));
        inferrer.observe(&cells(&["7"]));
        let analysis = inferrer.finish();

        assert_eq!(analysis.column_schema[0].field_type, FieldType::String);
    }

    #[tokio::test]
    async fn test_analyze_structure_counts_every_row() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,joined").unwrap();
        for i in 0..2500 {
            writeln!(file, "{i},2024-02-{:02}", i % 28 + 1).unwrap();
        }
        file.flush().unwrap();

        let analysis = analyze_structure(file.path(), &IngestOptions::default(), 1000, 3)
            .await
            .unwrap();

        assert_eq!(analysis.total_rows, 2500);
        assert_eq!(analysis.sampled_rows, 1000);
        assert_eq!(analysis.column_schema.len(), 2);
        assert_eq!(analysis.column_schema[1].field_type, FieldType::Date);
        assert_eq!(analysis.column_schema[1].sample_values.len(), 3);
    }
}
