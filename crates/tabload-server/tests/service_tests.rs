//! Retry, cancellation and queue administration through the ingestion service

mod common;

use common::{
    products_csv, test_ingest_config, wait_for_progress, wait_for_terminal, Harness,
    ScriptedStore,
};
use std::sync::Arc;
use tabload_server::error::IngestError;
use tabload_server::ingest::{
    DatasetStatus, IngestConfig, IngestOptions, IngestionJob, IssueCategory, JobStatus,
    CSV_INGESTION_QUEUE,
};
use tabload_server::store::{IngestStore, MemoryStore};
use tokio::sync::Semaphore;

#[tokio::test]
async fn test_retry_completed_job_is_rejected() {
    let harness = Harness::start().await;
    let source = harness.write_csv("done.csv", &products_csv(2));
    let job = harness
        .submit_and_wait(source, IngestOptions::default())
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let err = harness.service.retry_job(job.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let config = IngestConfig {
        max_retries: 0,
        ..test_ingest_config()
    };
    let harness = Harness::with_config(config).await;
    let mut source = harness.write_csv("bad.csv", &products_csv(2));
    source.declared_size = 3;

    let job = harness
        .submit_and_wait(source, IngestOptions::default())
        .await;
    assert_eq!(job.status, JobStatus::Failed);

    let err = harness.service.retry_job(job.id).await.unwrap_err();
    assert!(matches!(err, IngestError::MaxRetriesExceeded { max_retries: 0, .. }));
    assert_eq!(err.code(), "MAX_RETRIES_EXCEEDED");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_retry_unknown_job() {
    let harness = Harness::start().await;
    let err = harness
        .service
        .retry_job(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "JOB_NOT_FOUND");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_batch_failure_then_retry_converges() {
    let memory = Arc::new(MemoryStore::new());
    let scripted = Arc::new(ScriptedStore::new(memory.clone()).failing_from(2));
    let harness = Harness::with_store(memory.clone(), scripted.clone(), test_ingest_config()).await;
    let source = harness.write_csv("flaky.csv", &products_csv(6));
    let path = std::path::PathBuf::from(&source.path);

    let job = harness
        .submit_and_wait(source, IngestOptions::default())
        .await;
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.clone().unwrap_or_default();
    assert!(message.contains("Batch persist failed"), "got: {message}");
    assert!(path.exists());

    let dataset = harness
        .service
        .get_dataset_for_job(job.id)
        .await
        .unwrap()
        .expect("dataset created before the failure");
    assert_eq!(dataset.status, DatasetStatus::Failed);
    assert_eq!(memory.count_rows(dataset.id).await.unwrap(), 2);

    let issues = memory.issues_for(dataset.id).await;
    let system: Vec<_> = issues
        .iter()
        .filter(|i| i.category == IssueCategory::SystemError)
        .collect();
    assert_eq!(system.len(), 1);
    assert_eq!(
        system[0].details.as_ref().map(|d| d["error_code"].clone()),
        Some(serde_json::json!("BATCH_PERSIST_ERROR"))
    );

    scripted.stop_failing();
    let mut events = harness.queue.subscribe();
    let retried = harness.service.retry_job(job.id).await.unwrap();
    assert_eq!(retried.retry_count, 1);
    wait_for_terminal(&mut events, &job.id.to_string()).await;

    let job = harness.service.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);

    let again = harness
        .service
        .get_dataset_for_job(job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, dataset.id, "retry reuses the dataset");
    assert_eq!(again.status, DatasetStatus::Active);
    assert_eq!(again.total_rows, 6);
    assert_eq!(memory.count_rows(dataset.id).await.unwrap(), 6);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_job_keeps_rows() {
    let memory = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(1));
    let scripted = Arc::new(ScriptedStore::new(memory.clone()).gated(gate.clone()));
    let harness = Harness::with_store(memory.clone(), scripted, test_ingest_config()).await;
    let source = harness.write_csv("long.csv", &products_csv(20));

    let mut events = harness.queue.subscribe();
    let job = harness
        .service
        .submit(source, IngestOptions::default())
        .await
        .unwrap();
    let job_id = job.id.to_string();

    // first batch landed, second is held at the gate
    wait_for_progress(&mut events, &job_id, |p| {
        p.current_step == "streaming_batch_insert" && p.processed_rows > 0
    })
    .await;

    let cancelled = harness.service.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    gate.add_permits(100);
    wait_for_terminal(&mut events, &job_id).await;

    let job = harness.service.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    let stats = job.processing_stats.expect("stats recorded on cancel");
    assert_eq!(stats["cancelled"], true);

    let dataset = harness
        .service
        .get_dataset_for_job(job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dataset.status, DatasetStatus::Failed);
    let kept = memory.count_rows(dataset.id).await.unwrap();
    assert!(kept > 0 && kept < 20, "kept {kept} rows");
    assert_eq!(dataset.total_rows, kept);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_waiting_job() {
    let harness = Harness::start().await;
    harness.queue.pause_queue(CSV_INGESTION_QUEUE).await.unwrap();
    let source = harness.write_csv("waiting.csv", &products_csv(2));

    let job = harness
        .service
        .submit(source, IngestOptions::default())
        .await
        .unwrap();
    let cancelled = harness.service.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let entry = harness
        .queue
        .get_job(CSV_INGESTION_QUEUE, &job.id.to_string())
        .await
        .unwrap();
    assert!(entry.is_none());
    assert!(harness
        .service
        .get_dataset_for_job(job.id)
        .await
        .unwrap()
        .is_none());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_completed_job_is_rejected() {
    let harness = Harness::start().await;
    let source = harness.write_csv("finished.csv", &products_csv(2));
    let job = harness
        .submit_and_wait(source, IngestOptions::default())
        .await;

    let err = harness.service.cancel_job(job.id).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::InvalidStatus {
            status: JobStatus::Completed,
            ..
        }
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_retry_failed_jobs_summary() {
    let config = IngestConfig {
        max_retries: 1,
        ..test_ingest_config()
    };
    let harness = Harness::with_config(config).await;

    let mut failed = Vec::new();
    for name in ["a.csv", "b.csv"] {
        let mut source = harness.write_csv(name, &products_csv(2));
        source.declared_size = 1;
        let job = harness
            .submit_and_wait(source, IngestOptions::default())
            .await;
        assert_eq!(job.status, JobStatus::Failed);
        failed.push(job.id);
    }

    let mut events_a = harness.queue.subscribe();
    let mut events_b = harness.queue.subscribe();
    let summary = harness.service.retry_failed_jobs().await.unwrap();
    assert_eq!(summary.retried.len(), 2);
    assert!(summary.rejected.is_empty());
    wait_for_terminal(&mut events_a, &failed[0].to_string()).await;
    wait_for_terminal(&mut events_b, &failed[1].to_string()).await;

    // both failed again and have no retries left
    let summary = harness.service.retry_failed_jobs().await.unwrap();
    assert!(summary.retried.is_empty());
    assert_eq!(summary.rejected.len(), 2);
    assert!(summary
        .rejected
        .iter()
        .all(|r| r.code == "MAX_RETRIES_EXCEEDED"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_pause_resume_and_stats() {
    let harness = Harness::start().await;
    harness.queue.pause_queue(CSV_INGESTION_QUEUE).await.unwrap();

    let source = harness.write_csv("paused.csv", &products_csv(4));
    let mut events = harness.queue.subscribe();
    let job = harness
        .service
        .submit(source, IngestOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let stats = harness.service.queue_stats().await.unwrap();
    assert!(stats.paused);
    assert_eq!(stats.counts.waiting, 1);
    assert_eq!(stats.counts.active, 0);
    assert_eq!(
        harness.service.get_job(job.id).await.unwrap().status,
        JobStatus::Pending
    );

    harness.queue.resume_queue(CSV_INGESTION_QUEUE).await.unwrap();
    wait_for_terminal(&mut events, &job.id.to_string()).await;

    let stats = harness.service.queue_stats().await.unwrap();
    assert!(!stats.paused);
    assert_eq!(stats.counts.completed, 1);
    assert_eq!(
        harness.service.get_job(job.id).await.unwrap().status,
        JobStatus::Completed
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_enqueue_pending_discovers_stored_jobs() {
    let harness = Harness::start().await;
    let source = harness.write_csv("handoff.csv", &products_csv(3));

    // written by another process, never enqueued here
    let job = IngestionJob::new(source, IngestOptions::default(), 3);
    harness.memory.create_job(&job).await.unwrap();

    let mut events = harness.queue.subscribe();
    let enqueued = harness.service.enqueue_pending(10).await.unwrap();
    assert_eq!(enqueued, 1);
    wait_for_terminal(&mut events, &job.id.to_string()).await;

    let stored = harness.service.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(harness.service.enqueue_pending(10).await.unwrap(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_trailing_batch() {
    let memory = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(1));
    let scripted = Arc::new(ScriptedStore::new(memory.clone()).gated(gate.clone()));
    let harness = Harness::with_store(memory.clone(), scripted, test_ingest_config()).await;
    // batch size 2: one full batch, then a trailing batch of one row
    let source = harness.write_csv("three.csv", &products_csv(3));

    let mut events = harness.queue.subscribe();
    let job = harness
        .service
        .submit(source, IngestOptions::default())
        .await
        .unwrap();
    let job_id = job.id.to_string();

    wait_for_progress(&mut events, &job_id, |p| {
        p.current_step == "streaming_batch_insert" && p.processed_rows == 2
    })
    .await;
    harness.service.cancel_job(job.id).await.unwrap();
    gate.add_permits(100);
    wait_for_terminal(&mut events, &job_id).await;

    let job = harness.service.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    let stats = job.processing_stats.expect("stats recorded on cancel");
    assert_eq!(stats["cancelled"], true);

    let dataset = harness
        .service
        .get_dataset_for_job(job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dataset.status, DatasetStatus::Failed);
    assert_eq!(dataset.processing_stats.unwrap()["cancelled"], true);
    assert_eq!(dataset.total_rows, memory.count_rows(dataset.id).await.unwrap());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_while_finalizing() {
    let memory = Arc::new(MemoryStore::new());
    let scripted = Arc::new(ScriptedStore::new(memory.clone()).cancelling_on_activate());
    let harness = Harness::with_store(memory.clone(), scripted, test_ingest_config()).await;
    let source = harness.write_csv("late.csv", &products_csv(3));
    let path = std::path::PathBuf::from(&source.path);

    let job = harness
        .submit_and_wait(source, IngestOptions::default())
        .await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.processing_stats.expect("stats attached")["cancelled"], true);
    assert!(path.exists());

    let dataset = harness
        .service
        .get_dataset_for_job(job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dataset.status, DatasetStatus::Failed);
    assert_eq!(dataset.total_rows, 3);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_job_resumable() {
    let memory = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(1));
    let scripted = Arc::new(ScriptedStore::new(memory.clone()).gated(gate.clone()));
    let first = Harness::with_store(memory.clone(), scripted, test_ingest_config()).await;
    let source = first.write_csv("restart.csv", &products_csv(20));

    let mut events = first.queue.subscribe();
    let job = first
        .service
        .submit(source, IngestOptions::default())
        .await
        .unwrap();
    wait_for_progress(&mut events, &job.id.to_string(), |p| {
        p.current_step == "streaming_batch_insert" && p.processed_rows > 0
    })
    .await;

    tokio::join!(first.queue.close(), async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        gate.add_permits(100);
    });

    let interrupted = memory.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(interrupted.status, JobStatus::Processing);
    assert!(interrupted.error_message.is_none());
    let kept = memory
        .count_rows(interrupted.dataset_id.expect("dataset created"))
        .await
        .unwrap();
    assert!(kept < 20, "kept {kept} rows");

    // a restarted process finds the job and finishes it
    let second = Harness::with_store(memory.clone(), memory.clone(), test_ingest_config()).await;
    let mut events = second.queue.subscribe();
    assert_eq!(second.service.enqueue_pending(10).await.unwrap(), 1);
    wait_for_terminal(&mut events, &job.id.to_string()).await;

    let resumed = second.service.get_job(job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(resumed.retry_count, 0);
    let dataset = second
        .service
        .get_dataset_for_job(job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dataset.id, interrupted.dataset_id.unwrap());
    assert_eq!(dataset.status, DatasetStatus::Active);
    assert_eq!(dataset.total_rows, 20);

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_submit_after_discovery_enqueued_it() {
    let memory = Arc::new(MemoryStore::new());
    let scripted = Arc::new(ScriptedStore::new(memory.clone()));
    let harness =
        Harness::with_store(memory.clone(), scripted.clone(), test_ingest_config()).await;
    scripted.discover_on_create(harness.service.clone());
    let source = harness.write_csv("raced.csv", &products_csv(4));

    let job = harness
        .submit_and_wait(source, IngestOptions::default())
        .await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error_message.is_none());

    let entry = harness
        .queue
        .get_job(CSV_INGESTION_QUEUE, &job.id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempts_made, 1);

    harness.shutdown().await;
}
