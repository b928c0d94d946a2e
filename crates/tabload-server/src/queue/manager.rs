//! Named job queues with a fixed worker pool per queue
//!
//! Queue bookkeeping lives in memory; the broker is only consulted for
//! connectivity (startup and health checks). Each registered queue owns
//! `concurrency` worker tasks that pull the highest-priority waiting job,
//! hand it to the queue's [`JobProcessor`] and publish lifecycle events on a
//! shared broadcast channel.

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{ProgressPayload, QueueEvent, QueueEventKind};
use super::types::{
    AddJobOptions, HealthReport, QueueCounts, QueueHealth, QueueJob, QueueJobState, QueueOptions,
    QueueSamples, QueueStats, RetryReport, STATS_SAMPLE_SIZE,
};
use crate::config::QueueConfig;
use crate::error::QueueError;

/// How long a broker ping may take before the broker counts as unreachable
const BROKER_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Connectivity check for the backing broker
#[async_trait]
pub trait Broker: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Work executed for each job of a queue
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// Run one job; the returned value is published with the completed event
    async fn process(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value>;
}

/// Handle given to a [`JobProcessor`] for one job execution
pub struct JobContext {
    job: QueueJob,
    queue: Arc<QueueShared>,
    events: broadcast::Sender<QueueEvent>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl JobContext {
    /// Snapshot of the job as it was dispatched
    pub fn job(&self) -> &QueueJob {
        &self.job
    }

    /// True once [`JobQueueManager::cancel_job`] was called for this job
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True once the manager is closing. The job was not cancelled and
    /// should be left resumable.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Record progress on the job and publish a progress event
    pub async fn report_progress(&self, progress: ProgressPayload) {
        {
            let mut state = self.queue.state.lock().await;
            if let Some(job) = state.jobs.get_mut(&self.job.id) {
                job.progress = Some(progress.clone());
            }
        }
        self.queue
            .publish(&self.events, &self.job.id, QueueEventKind::Progress(progress));
    }
}

type WaitingKey = (Reverse<i32>, u64);

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, QueueJob>,
    /// Dispatch order: highest priority first, then insertion order
    waiting: BTreeMap<WaitingKey, String>,
    delayed: BTreeMap<(chrono::DateTime<Utc>, u64), String>,
    tokens: HashMap<String, CancellationToken>,
    paused: bool,
    seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_waiting(&mut self, id: &str, priority: i32) {
        let seq = self.next_seq();
        self.waiting.insert((Reverse(priority), seq), id.to_string());
    }

    fn push_delayed(&mut self, id: &str, run_at: chrono::DateTime<Utc>) {
        let seq = self.next_seq();
        self.delayed.insert((run_at, seq), id.to_string());
    }

    /// Move due delayed jobs to waiting; returns their ids
    fn promote_due(&mut self, now: chrono::DateTime<Utc>) -> Vec<String> {
        let mut promoted = Vec::new();
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.state = QueueJobState::Waiting;
            let priority = job.priority;
            self.push_waiting(&id, priority);
            promoted.push(id);
        }
        promoted
    }

    fn unlink(&mut self, id: &str) {
        self.waiting.retain(|_, queued| queued != id);
        self.delayed.retain(|_, queued| queued != id);
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for job in self.jobs.values() {
            match job.state {
                QueueJobState::Waiting => counts.waiting += 1,
                QueueJobState::Delayed => counts.delayed += 1,
                QueueJobState::Active => counts.active += 1,
                QueueJobState::Completed => counts.completed += 1,
                QueueJobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn sample(&self, state: QueueJobState) -> Vec<QueueJob> {
        let mut jobs: Vec<&QueueJob> = self.jobs.values().filter(|j| j.state == state).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.into_iter().take(STATS_SAMPLE_SIZE).cloned().collect()
    }

    fn reset_for_dispatch(&mut self, id: &str) -> Option<()> {
        let job = self.jobs.get_mut(id)?;
        job.state = QueueJobState::Waiting;
        job.failed_reason = None;
        job.return_value = None;
        job.progress = None;
        job.processed_at = None;
        job.finished_at = None;
        job.run_at = Utc::now();
        let priority = job.priority;
        self.push_waiting(id, priority);
        Some(())
    }
}

struct QueueShared {
    name: String,
    options: QueueOptions,
    state: Mutex<QueueState>,
    notify: Notify,
    live_workers: AtomicUsize,
}

impl QueueShared {
    fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            live_workers: AtomicUsize::new(0),
        }
    }

    fn publish(&self, events: &broadcast::Sender<QueueEvent>, job_id: &str, kind: QueueEventKind) {
        // No subscribers is fine
        let _ = events.send(QueueEvent::new(&self.name, job_id, kind));
    }

    async fn claim_next(
        &self,
        events: &broadcast::Sender<QueueEvent>,
    ) -> Option<(QueueJob, CancellationToken)> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Utc::now();

        for id in state.promote_due(now) {
            self.publish(events, &id, QueueEventKind::Waiting);
        }
        if state.paused {
            return None;
        }

        let (_, id) = state.waiting.pop_first()?;
        let job = state.jobs.get_mut(&id)?;
        job.state = QueueJobState::Active;
        job.processed_at = Some(now);
        job.attempts_made += 1;
        let snapshot = job.clone();

        let token = CancellationToken::new();
        state.tokens.insert(id.clone(), token.clone());
        self.publish(events, &id, QueueEventKind::Active);

        Some((snapshot, token))
    }

    async fn finish(
        &self,
        events: &broadcast::Sender<QueueEvent>,
        job_id: &str,
        outcome: Result<serde_json::Value, String>,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.tokens.remove(job_id);

        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };
        job.finished_at = Some(Utc::now());

        let kind = match outcome {
            Ok(value) => {
                job.state = QueueJobState::Completed;
                job.return_value = Some(value.clone());
                job.failed_reason = None;
                QueueEventKind::Completed(value)
            }
            Err(error) => {
                job.state = QueueJobState::Failed;
                job.failed_reason = Some(error.clone());
                QueueEventKind::Failed { error }
            }
        };
        self.publish(events, job_id, kind);
    }
}

struct Worker {
    index: usize,
    queue: Arc<QueueShared>,
    processor: Arc<dyn JobProcessor>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl Worker {
    async fn run(self) {
        debug!(queue = %self.queue.name, worker = self.index, "Queue worker started");

        while !self.shutdown.is_cancelled() {
            match self.queue.claim_next(&self.events).await {
                Some((job, token)) => self.execute(job, token).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.queue.notify.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        self.queue.live_workers.fetch_sub(1, Ordering::SeqCst);
        debug!(queue = %self.queue.name, worker = self.index, "Queue worker stopped");
    }

    async fn execute(&self, job: QueueJob, cancel: CancellationToken) {
        let job_id = job.id.clone();
        debug!(queue = %self.queue.name, job_id = %job_id, worker = self.index, "Dispatching job");

        let ctx = JobContext {
            job,
            queue: Arc::clone(&self.queue),
            events: self.events.clone(),
            cancel,
            shutdown: self.shutdown.clone(),
        };
        let processor = Arc::clone(&self.processor);

        // A separate task turns a processor panic into a JoinError instead of killing the worker
        let handle = tokio::spawn(async move { processor.process(ctx).await });

        let outcome = match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                warn!(queue = %self.queue.name, job_id = %job_id, error = %format!("{err:#}"), "Job failed");
                Err(format!("{err:#}"))
            }
            Err(join_err) => {
                error!(queue = %self.queue.name, job_id = %job_id, error = %join_err, "Job processor stalled");
                self.queue
                    .publish(&self.events, &job_id, QueueEventKind::Stalled);
                if join_err.is_panic() {
                    Err("job processor panicked".to_string())
                } else {
                    Err("job processor was aborted".to_string())
                }
            }
        };

        self.queue.finish(&self.events, &job_id, outcome).await;
    }
}

/// Registry of named queues and their worker pools
pub struct JobQueueManager {
    broker: Arc<dyn Broker>,
    config: QueueConfig,
    queues: RwLock<HashMap<String, Arc<QueueShared>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
}

impl JobQueueManager {
    /// Connect to the broker; fails without side effects when it is unreachable
    pub async fn connect(broker: Arc<dyn Broker>, config: QueueConfig) -> Result<Self, QueueError> {
        ping_broker(broker.as_ref())
            .await
            .map_err(QueueError::BrokerUnavailable)?;

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        info!(poll_interval_ms = config.poll_interval_ms, "Job queue manager connected");

        Ok(Self {
            broker,
            config,
            queues: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    /// Create a queue and start its worker pool
    pub async fn register_queue(
        &self,
        name: &str,
        options: QueueOptions,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let mut queues = self.queues.write().await;
        if queues.contains_key(name) {
            return Err(QueueError::QueueAlreadyRegistered(name.to_string()));
        }

        let concurrency = options.concurrency.max(1);
        let shared = Arc::new(QueueShared::new(name, QueueOptions { concurrency }));
        let mut workers = self.workers.lock().await;

        for index in 0..concurrency {
            let worker = Worker {
                index,
                queue: Arc::clone(&shared),
                processor: Arc::clone(&processor),
                events: self.events.clone(),
                shutdown: self.shutdown.clone(),
                poll_interval: self.config.poll_interval(),
            };
            shared.live_workers.fetch_add(1, Ordering::SeqCst);
            workers.push(tokio::spawn(worker.run()));
        }

        queues.insert(name.to_string(), shared);
        info!(queue = name, concurrency, "Queue registered");
        Ok(())
    }

    async fn queue(&self, name: &str) -> Result<Arc<QueueShared>, QueueError> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    /// Enqueue a job; explicit ids must be unique within the queue
    pub async fn add_job(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        options: AddJobOptions,
    ) -> Result<QueueJob, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let queue = self.queue(queue_name).await?;
        let id = options
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let now = Utc::now();
        let run_at = options
            .delay
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now);
        let delayed = run_at > now;

        let job = QueueJob {
            id: id.clone(),
            queue: queue_name.to_string(),
            payload,
            priority: options.priority,
            state: if delayed {
                QueueJobState::Delayed
            } else {
                QueueJobState::Waiting
            },
            progress: None,
            attempts_made: 0,
            retry_count: 0,
            max_retries: options.max_retries,
            failed_reason: None,
            return_value: None,
            created_at: now,
            run_at,
            processed_at: None,
            finished_at: None,
        };

        {
            let mut state = queue.state.lock().await;
            if state.jobs.contains_key(&id) {
                return Err(QueueError::DuplicateJob {
                    queue: queue_name.to_string(),
                    job_id: id,
                });
            }
            state.jobs.insert(id.clone(), job.clone());
            if delayed {
                state.push_delayed(&id, run_at);
            } else {
                state.push_waiting(&id, job.priority);
                queue.publish(&self.events, &id, QueueEventKind::Waiting);
            }
        }

        queue.notify.notify_one();
        debug!(queue = queue_name, job_id = %id, priority = job.priority, delayed, "Job added");
        Ok(job)
    }

    /// Look up a job; `None` when it does not exist
    pub async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<QueueJob>, QueueError> {
        let queue = self.queue(queue_name).await?;
        let state = queue.state.lock().await;
        Ok(state.jobs.get(job_id).cloned())
    }

    /// All jobs currently in `state`, oldest first
    pub async fn jobs_in_state(
        &self,
        queue_name: &str,
        job_state: QueueJobState,
    ) -> Result<Vec<QueueJob>, QueueError> {
        let queue = self.queue(queue_name).await?;
        let state = queue.state.lock().await;
        let mut jobs: Vec<QueueJob> = state
            .jobs
            .values()
            .filter(|j| j.state == job_state)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats, QueueError> {
        let queue = self.queue(queue_name).await?;
        let state = queue.state.lock().await;

        Ok(QueueStats {
            queue: queue_name.to_string(),
            paused: state.paused,
            counts: state.counts(),
            samples: QueueSamples {
                waiting: state.sample(QueueJobState::Waiting),
                active: state.sample(QueueJobState::Active),
                completed: state.sample(QueueJobState::Completed),
                failed: state.sample(QueueJobState::Failed),
                delayed: state.sample(QueueJobState::Delayed),
            },
        })
    }

    /// Stop dispatching new jobs; running jobs continue
    pub async fn pause_queue(&self, queue_name: &str) -> Result<(), QueueError> {
        let queue = self.queue(queue_name).await?;
        queue.state.lock().await.paused = true;
        info!(queue = queue_name, "Queue paused");
        Ok(())
    }

    pub async fn resume_queue(&self, queue_name: &str) -> Result<(), QueueError> {
        let queue = self.queue(queue_name).await?;
        queue.state.lock().await.paused = false;
        queue.notify.notify_waiters();
        info!(queue = queue_name, "Queue resumed");
        Ok(())
    }

    /// Remove up to `limit` finished jobs that ended more than `grace` ago, oldest first
    pub async fn clean_queue(
        &self,
        queue_name: &str,
        grace: Duration,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let queue = self.queue(queue_name).await?;
        let Some(cutoff) = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(Vec::new());
        };

        let mut state = queue.state.lock().await;
        let mut expired: Vec<(chrono::DateTime<Utc>, String)> = state
            .jobs
            .values()
            .filter(|j| j.state.is_finished())
            .filter_map(|j| j.finished_at.filter(|at| *at <= cutoff).map(|at| (at, j.id.clone())))
            .collect();
        expired.sort();
        expired.truncate(limit);

        let removed: Vec<String> = expired.into_iter().map(|(_, id)| id).collect();
        for id in &removed {
            state.jobs.remove(id);
        }

        if !removed.is_empty() {
            info!(queue = queue_name, removed = removed.len(), "Queue cleaned");
        }
        Ok(removed)
    }

    /// Re-admit every failed job that still has retries left
    pub async fn retry_failed_jobs(&self, queue_name: &str) -> Result<RetryReport, QueueError> {
        let queue = self.queue(queue_name).await?;
        let mut report = RetryReport::default();

        {
            let mut guard = queue.state.lock().await;
            let state = &mut *guard;

            let mut failed: Vec<(chrono::DateTime<Utc>, String, bool)> = state
                .jobs
                .values()
                .filter(|j| j.state == QueueJobState::Failed)
                .map(|j| (j.created_at, j.id.clone(), j.retry_count < j.max_retries))
                .collect();
            failed.sort();

            for (_, id, retryable) in failed {
                if !retryable {
                    report.exhausted.push(id);
                    continue;
                }
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.retry_count += 1;
                }
                if state.reset_for_dispatch(&id).is_some() {
                    queue.publish(&self.events, &id, QueueEventKind::Waiting);
                    report.retried.push(id);
                }
            }
        }

        for _ in 0..report.retried.len() {
            queue.notify.notify_one();
        }
        info!(
            queue = queue_name,
            retried = report.retried.len(),
            exhausted = report.exhausted.len(),
            "Failed jobs re-admitted"
        );
        Ok(report)
    }

    /// Send one finished job back to waiting without touching its retry budget
    pub async fn requeue_job(&self, queue_name: &str, job_id: &str) -> Result<QueueJob, QueueError> {
        let queue = self.queue(queue_name).await?;
        let job = {
            let mut state = queue.state.lock().await;
            let current = state.jobs.get(job_id).map(|j| j.state).ok_or_else(|| {
                QueueError::JobNotFound {
                    queue: queue_name.to_string(),
                    job_id: job_id.to_string(),
                }
            })?;
            if !current.is_finished() {
                return Err(QueueError::NotRequeueable {
                    job_id: job_id.to_string(),
                    state: current.to_string(),
                });
            }
            state.reset_for_dispatch(job_id);
            queue.publish(&self.events, job_id, QueueEventKind::Waiting);
            state.jobs.get(job_id).cloned()
        };

        queue.notify.notify_one();
        job.ok_or_else(|| QueueError::JobNotFound {
            queue: queue_name.to_string(),
            job_id: job_id.to_string(),
        })
    }

    /// Drop a job that is not running; returns false for active or unknown jobs
    pub async fn remove_job(&self, queue_name: &str, job_id: &str) -> Result<bool, QueueError> {
        let queue = self.queue(queue_name).await?;
        let mut state = queue.state.lock().await;

        match state.jobs.get(job_id).map(|j| j.state) {
            Some(QueueJobState::Active) | None => Ok(false),
            Some(_) => {
                state.unlink(job_id);
                state.jobs.remove(job_id);
                debug!(queue = queue_name, job_id, "Job removed");
                Ok(true)
            }
        }
    }

    /// Signal cancellation to a running job; returns false when it is not running
    pub async fn cancel_job(&self, queue_name: &str, job_id: &str) -> Result<bool, QueueError> {
        let queue = self.queue(queue_name).await?;
        let state = queue.state.lock().await;

        match state.tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                info!(queue = queue_name, job_id, "Cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Broker latency plus worker liveness of every queue
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let ping = ping_broker(self.broker.as_ref()).await;
        let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut queues = Vec::new();
        for (name, queue) in self.queues.read().await.iter() {
            let state = queue.state.lock().await;
            let live_workers = queue.live_workers.load(Ordering::SeqCst);
            queues.push(QueueHealth {
                name: name.clone(),
                reachable: live_workers > 0 && !self.shutdown.is_cancelled(),
                paused: state.paused,
                live_workers,
                concurrency: queue.options.concurrency,
                counts: state.counts(),
            });
        }
        queues.sort_by(|a, b| a.name.cmp(&b.name));

        let broker_connected = ping.is_ok();
        HealthReport {
            healthy: broker_connected && queues.iter().all(|q| q.reachable),
            broker_connected,
            broker_latency_ms: broker_connected.then_some(latency),
            broker_error: ping.err(),
            queues,
            checked_at: Utc::now(),
        }
    }

    /// Receive lifecycle events of every queue
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Stop all workers and wait for them to exit. In-flight jobs observe
    /// [`JobContext::is_shutting_down`]; their cancellation tokens are not fired.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.workers.lock().await);
        let count = handles.len();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Queue worker ended abnormally");
            }
        }

        if count > 0 {
            info!(workers = count, "Job queue manager closed");
        }
    }
}

async fn ping_broker(broker: &dyn Broker) -> Result<(), String> {
    match tokio::time::timeout(BROKER_PING_TIMEOUT, broker.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err(format!(
            "broker did not answer within {}s",
            BROKER_PING_TIMEOUT.as_secs()
        )),
    }
}
