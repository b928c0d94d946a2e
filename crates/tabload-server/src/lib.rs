//! Tabload Server Library
//!
//! Asynchronous CSV ingestion service: uploaded CSV files become datasets with
//! an inferred column schema, one JSON document per row and a list of
//! data-quality issues.
//!
//! # Overview
//!
//! - **Job Queue**: Named in-process queues with a fixed worker pool each,
//!   priorities, delays, pause/resume, retry and lifecycle events
//! - **CSV Ingestion**: Validation, schema inference, batched idempotent row
//!   inserts with inline quality checks and stage-banded progress
//! - **Issue Logging**: Buffered, bulk-written diagnostics that never block
//!   ingestion
//! - **Storage**: PostgreSQL via SQLx, with an in-memory store for tests and
//!   dry runs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabload_server::config::Config;
//! use tabload_server::ingest::{IngestOptions, IngestionService, IssueLogger, SourceFile};
//! use tabload_server::queue::JobQueueManager;
//! use tabload_server::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let store = Arc::new(MemoryStore::new());
//!     let queue = Arc::new(JobQueueManager::connect(store.clone(), config.queue.clone()).await?);
//!     let issues = IssueLogger::start(store.clone(), config.ingest.issues.clone());
//!
//!     let service = IngestionService::new(store, queue.clone(), config.ingest.clone());
//!     service.start_workers(issues.clone()).await?;
//!
//!     let job = service
//!         .submit(SourceFile::new("/tmp/products.csv", 1024), IngestOptions::default())
//!         .await?;
//!     println!("submitted {}", job.id);
//!
//!     queue.close().await;
//!     issues.close().await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod ingest;
pub mod pagination;
pub mod queue;
pub mod store;

// Re-export commonly used types
pub use error::{IngestError, IngestResult, QueueError, StoreError, StoreResult};
