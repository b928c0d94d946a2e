//! Common types used across Tabload

use serde::{Deserialize, Serialize};

use crate::error::{Result, TabloadError};

// ============================================================================
// Column Schema Types
// ============================================================================

/// Inferred type of a dataset column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Boolean,
    Date,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
        }
    }

    /// Resolution rank when several types were observed; higher is more specific
    pub fn specificity(&self) -> u8 {
        match self {
            FieldType::String => 0,
            FieldType::Boolean => 1,
            FieldType::Number => 2,
            FieldType::Date => 3,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FieldType {
    type Err = TabloadError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" | "text" => Ok(FieldType::String),
            "number" | "numeric" => Ok(FieldType::Number),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            other => Err(TabloadError::UnknownFieldType(other.to_string())),
        }
    }
}

/// One column of a dataset's ordered schema
///
/// # Examples
///
/// ```rust
/// use tabload_common::types::{FieldInfo, FieldType};
///
/// let field = FieldInfo::new("age", FieldType::Number, true);
/// assert_eq!(field.name, "age");
/// assert!(field.sample_values.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Canonical column name (header value or `Column_N`)
    pub name: String,

    /// Inferred column type
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Whether an empty value was observed in the sample window
    pub nullable: bool,

    /// A few distinct values seen during inference
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_values: Vec<String>,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
            sample_values: Vec::new(),
        }
    }
}

/// Encode an ordered column schema as JSON for storage
pub fn schema_to_json(fields: &[FieldInfo]) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(fields)?)
}

/// Decode an ordered column schema from its stored JSON form
pub fn schema_from_json(value: serde_json::Value) -> Result<Vec<FieldInfo>> {
    Ok(serde_json::from_value(value)?)
}
