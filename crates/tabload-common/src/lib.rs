//! Tabload Common Library
//!
//! Shared types, utilities, and error handling for the Tabload workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`TabloadError`] and the [`Result`] alias
//! - **Checksums**: content hashing for ingested rows
//! - **Types**: column schema types shared by the pipeline and the store
//! - **Logging**: `tracing` subscriber bootstrap driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use tabload_common::checksum::row_content_hash;
//! use tabload_common::types::FieldType;
//!
//! let hash = row_content_hash(["1", "Alice", "30"]);
//! assert_eq!(hash.len(), 64);
//! assert_eq!("number".parse::<FieldType>().ok(), Some(FieldType::Number));
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TabloadError};
