//! Error types shared across Tabload crates

use thiserror::Error;

/// Result type alias for shared Tabload operations
pub type Result<T> = std::result::Result<T, TabloadError>;

/// Main error type for shared utilities
#[derive(Error, Debug)]
pub enum TabloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown field type: {0}")]
    UnknownFieldType(String),
}
