//! In-process job queues
//!
//! A [`JobQueueManager`] owns any number of named queues. Each queue gets a
//! fixed pool of worker tasks and a [`JobProcessor`] that does the actual work;
//! the manager itself knows nothing about what a job does.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabload_server::config::QueueConfig;
//! use tabload_server::queue::{AddJobOptions, Broker, JobQueueManager, JobProcessor, QueueOptions};
//!
//! # async fn example(broker: Arc<dyn Broker>, processor: Arc<dyn JobProcessor>) -> anyhow::Result<()> {
//! let manager = JobQueueManager::connect(broker, QueueConfig::default()).await?;
//! manager.register_queue("csv-ingestion", QueueOptions { concurrency: 5 }, processor).await?;
//!
//! let job = manager
//!     .add_job("csv-ingestion", serde_json::json!({}), AddJobOptions::default().priority(5))
//!     .await?;
//! println!("queued {}", job.id);
//!
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod manager;
pub mod types;

pub use events::{ProgressPayload, QueueEvent, QueueEventKind};
pub use manager::{Broker, JobContext, JobProcessor, JobQueueManager};
pub use types::{
    AddJobOptions, HealthReport, QueueCounts, QueueHealth, QueueJob, QueueJobState, QueueOptions,
    QueueStats, RetryReport,
};
