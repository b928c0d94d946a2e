//! Inline data-quality checks
//!
//! [`RowChecker`] maps a raw row onto the inferred schema and collects the
//! problems found along the way. Checks never reject a row: every cell is
//! stored, problem cells as plain strings. Stored text is trimmed; the
//! content hash covers the cells as read.

use regex::Regex;
use serde_json::{Map, Number, Value};

use super::reader::RawRow;
use super::schema::{is_date, is_number, parse_boolean};
use crate::error::{IngestError, IngestResult};
use tabload_common::checksum::row_content_hash;
use tabload_common::types::{FieldInfo, FieldType};

const EMAIL_PATTERN: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";

/// One data-quality finding; at most one per rule per cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellProblem {
    Missing {
        column: String,
        nullable: bool,
    },
    TypeMismatch {
        column: String,
        value: String,
        expected: FieldType,
    },
    InvalidEmail {
        column: String,
        value: String,
    },
    ExtraCells {
        cells: usize,
        expected: usize,
    },
}

/// Row mapped to canonical column names, ready for insertion
#[derive(Debug, Clone)]
pub struct CheckedRow {
    pub index: u64,
    pub data: Value,
    pub content_hash: String,
    pub problems: Vec<CellProblem>,
}

impl CheckedRow {
    pub fn row_number(&self) -> i64 {
        self.index as i64 + 1
    }
}

/// Type a column is expected to hold based on its name alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameHint {
    Date,
    Numeric,
}

fn name_hint(name: &str) -> Option<NameHint> {
    let lower = name.to_lowercase();
    if lower.contains("date") {
        Some(NameHint::Date)
    } else if ["price", "quantity", "amount"]
        .iter()
        .any(|word| lower.contains(word))
    {
        Some(NameHint::Numeric)
    } else {
        None
    }
}

struct ColumnCheck {
    name: String,
    field_type: FieldType,
    nullable: bool,
    hint: Option<NameHint>,
    email: bool,
}

pub struct RowChecker {
    columns: Vec<ColumnCheck>,
    expected_width: usize,
    email_pattern: Regex,
}

impl RowChecker {
    /// `header_width` is the width rows are compared against for extra
    /// cells; without a header row the schema width is used
    pub fn new(schema: &[FieldInfo], header_width: Option<usize>) -> IngestResult<Self> {
        let email_pattern = Regex::new(EMAIL_PATTERN)
            .map_err(|e| IngestError::StructuralAnalysis(format!("invalid email pattern: {e}")))?;

        let columns = schema
            .iter()
            .map(|field| ColumnCheck {
                name: field.name.clone(),
                field_type: field.field_type,
                nullable: field.nullable,
                hint: name_hint(&field.name),
                email: field.name.to_lowercase().contains("email"),
            })
            .collect::<Vec<_>>();

        Ok(Self {
            expected_width: header_width.unwrap_or(columns.len()),
            columns,
            email_pattern,
        })
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn check(&self, row: &RawRow) -> CheckedRow {
        let mut data = Map::with_capacity(self.columns.len());
        let mut problems = Vec::new();

        if row.cells.len() > self.expected_width {
            problems.push(CellProblem::ExtraCells {
                cells: row.cells.len(),
                expected: self.expected_width,
            });
        }

        for (i, column) in self.columns.iter().enumerate() {
            let raw = row.cells.get(i).map(String::as_str).unwrap_or("");
            let value = raw.trim();

            if value.is_empty() {
                problems.push(CellProblem::Missing {
                    column: column.name.clone(),
                    nullable: column.nullable,
                });
                data.insert(column.name.clone(), Value::Null);
                continue;
            }

            let stored = match column.field_type {
                FieldType::String => {
                    let expected = match column.hint {
                        Some(NameHint::Date) if !is_date(value) => Some(FieldType::Date),
                        Some(NameHint::Numeric) if !is_number(value) => Some(FieldType::Number),
                        _ => None,
                    };
                    if let Some(expected) = expected {
                        problems.push(CellProblem::TypeMismatch {
                            column: column.name.clone(),
                            value: value.to_string(),
                            expected,
                        });
                    }
                    Value::String(value.to_string())
                }
                typed => coerce(value, typed).unwrap_or_else(|| {
                    problems.push(CellProblem::TypeMismatch {
                        column: column.name.clone(),
                        value: value.to_string(),
                        expected: typed,
                    });
                    Value::String(value.to_string())
                }),
            };

            if column.email && !self.email_pattern.is_match(value) {
                problems.push(CellProblem::InvalidEmail {
                    column: column.name.clone(),
                    value: value.to_string(),
                });
            }

            data.insert(column.name.clone(), stored);
        }

        // cells past the schema are kept rather than dropped
        for (i, cell) in row.cells.iter().enumerate().skip(self.columns.len()) {
            data.entry(format!("Column_{}", i + 1))
                .or_insert_with(|| Value::String(cell.trim().to_string()));
        }

        CheckedRow {
            index: row.index,
            data: Value::Object(data),
            content_hash: row_content_hash(&row.cells),
            problems,
        }
    }
}

/// JSON value for a cell of a typed column, or `None` when it does not parse.
/// Integers too wide for 64 bits stay strings so no digits are lost.
pub fn coerce(value: &str, field_type: FieldType) -> Option<Value> {
    match field_type {
        FieldType::Number => {
            if let Ok(int) = value.parse::<i64>() {
                return Some(Value::Number(int.into()));
            }
            if let Ok(int) = value.parse::<u64>() {
                return Some(Value::Number(int.into()));
            }
            if is_integer_literal(value) {
                return Some(Value::String(value.to_string()));
            }
            value
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        }
        FieldType::Boolean => parse_boolean(value).map(Value::Bool),
        FieldType::Date => is_date(value).then(|| Value::String(value.to_string())),
        FieldType::String => Some(Value::String(value.to_string())),
    }
}

fn is_integer_literal(value: &str) -> bool {
    let digits = value
        .strip_prefix('-')
        .or_else(|| value.strip_prefix('+'))
        .unwrap_or(value);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(index: u64, cells: &[&str]) -> RawRow {
        RawRow {
            index,
            cells: cells.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn schema() -> Vec<FieldInfo> {
        vec![
            FieldInfo::new("id", FieldType::Number, false),
            FieldInfo::new("name", FieldType::String, false),
            FieldInfo::new("price", FieldType::String, false),
            FieldInfo::new("email", FieldType::String, true),
        ]
    }

    #[test]
    fn test_clean_row_is_coerced() {
        let checker = RowChecker::new(&schema(), Some(4)).unwrap();
        let checked = checker.check(&row(0, &["1", "Widget", "9.99", "a@example.com"]));

        assert!(checked.problems.is_empty());
        assert_eq!(
            checked.data,
            json!({"id": 1, "name": "Widget", "price": "9.99", "email": "a@example.com"})
        );
        assert_eq!(checked.row_number(), 1);
        assert_eq!(checked.content_hash.len(), 64);
    }

    #[test]
    fn test_each_rule_fires_once() {
        let checker = RowChecker::new(&schema(), Some(4)).unwrap();
        let checked = checker.check(&row(1, &["2", "", "abc", "bad-email"]));

        assert_eq!(
            checked.problems,
            vec![
                CellProblem::Missing {
                    column: "name".to_string(),
                    nullable: false
                },
                CellProblem::TypeMismatch {
                    column: "price".to_string(),
                    value: "abc".to_string(),
                    expected: FieldType::Number
                },
                CellProblem::InvalidEmail {
                    column: "email".to_string(),
                    value: "bad-email".to_string()
                },
            ]
        );
        assert_eq!(checked.data["name"], Value::Null);
        assert_eq!(checked.data["price"], json!("abc"));
    }

    #[test]
    fn test_typed_column_mismatch_is_stored_as_string() {
        let checker = RowChecker::new(&schema(), None).unwrap();
        let checked = checker.check(&row(0, &["n/a", "x", "1", "a@b.io"]));

        assert_eq!(checked.problems.len(), 1);
        assert_eq!(checked.data["id"], json!("n/a"));
    }

    #[test]
    fn test_missing_trailing_cells_and_extra_cells() {
        let checker = RowChecker::new(&schema(), Some(4)).unwrap();

        let short = checker.check(&row(0, &["1", "x", "2"]));
        assert_eq!(
            short.problems,
            vec![CellProblem::Missing {
                column: "email".to_string(),
                nullable: true
            }]
        );

        let wide = checker.check(&row(1, &["1", "x", "2", "a@b.io", "extra"]));
        assert_eq!(
            wide.problems,
            vec![CellProblem::ExtraCells {
                cells: 5,
                expected: 4
            }]
        );
        assert_eq!(wide.data["Column_5"], json!("extra"));
    }

    #[test]
    fn test_cells_are_stored_trimmed() {
        let checker = RowChecker::new(&schema(), Some(4)).unwrap();
        let checked = checker.check(&row(0, &[" 7 ", "  Gadget ", "n/a ", " b@x.io", " more "]));

        assert_eq!(checked.data["id"], json!(7));
        assert_eq!(checked.data["name"], json!("Gadget"));
        assert_eq!(checked.data["price"], json!("n/a"));
        assert_eq!(checked.data["email"], json!("b@x.io"));
        assert_eq!(checked.data["Column_5"], json!("more"));
    }

    #[test]
    fn test_date_named_string_column() {
        let schema = vec![FieldInfo::new("Order Date", FieldType::String, true)];
        let checker = RowChecker::new(&schema, None).unwrap();

        assert!(checker.check(&row(0, &["2024-03-01"])).problems.is_empty());
        assert_eq!(checker.check(&row(1, &["soon"])).problems.len(), 1);
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce("42", FieldType::Number), Some(json!(42)));
        assert_eq!(coerce("2.5", FieldType::Number), Some(json!(2.5)));
        assert_eq!(
            coerce("18446744073709551615", FieldType::Number),
            Some(json!(u64::MAX))
        );
        assert_eq!(
            coerce("-123456789012345678901234", FieldType::Number),
            Some(json!("-123456789012345678901234"))
        );
        assert_eq!(coerce("Yes", FieldType::Boolean), Some(json!(true)));
        assert_eq!(coerce("maybe", FieldType::Boolean), None);
        assert_eq!(coerce("2024-01-01", FieldType::Date), Some(json!("2024-01-01")));
        assert_eq!(coerce("yesterday", FieldType::Date), None);
    }
}
