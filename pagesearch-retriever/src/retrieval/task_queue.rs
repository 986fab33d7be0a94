use super::indexer::IndexOutcome;
use crate::storage::DocumentId;
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Identifier handed back by [`TaskQueue::submit`]. Monotonic per process.
pub type JobId = u64;

/// A request to index one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexingJob {
    pub id: JobId,
    pub document_id: DocumentId,
    pub force_regenerate: bool,
    /// Times this job has been redelivered after a timeout
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl IndexingJob {
    fn new(id: JobId, document_id: DocumentId, force_regenerate: bool) -> Self {
        Self {
            id,
            document_id,
            force_regenerate,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Check if the job may be redelivered once more
    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    /// Get a description of the job for logging
    pub fn description(&self) -> String {
        format!(
            "job {} (document {}, force={}, attempt {})",
            self.id,
            self.document_id,
            self.force_regenerate,
            self.retry_count + 1
        )
    }
}

/// Lifecycle of a job as seen through [`TaskQueue::job_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running { attempt: u32 },
    /// Timed out and redelivered
    Retrying { attempt: u32 },
    Succeeded { outcome: IndexOutcome },
    Failed { error: String },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Succeeded { .. } | JobState::Failed { .. })
    }
}

/// Observable record of a job, retained for [`TaskQueueConfig::result_ttl`] after it
/// finishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub document_id: DocumentId,
    pub force_regenerate: bool,
    #[serde(flatten)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Configuration for the task queue
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Maximum number of jobs waiting in the channel
    pub max_queue_size: usize,
    /// Maximum number of concurrent workers
    pub max_workers: usize,
    /// Timeout for one indexing attempt
    pub job_timeout: Duration,
    /// How long finished job records are kept
    pub result_ttl: Duration,
    /// Redeliveries after a timeout before the job fails
    pub max_retries: u32,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
            max_workers: 4,
            job_timeout: Duration::from_secs(600), // 10 minutes
            result_ttl: Duration::from_secs(24 * 60 * 60),
            max_retries: 3,
        }
    }
}

/// Bounded FIFO of indexing jobs plus the records that make them observable.
///
/// Producers call [`submit`](Self::submit); workers pull from
/// [`receiver`](Self::receiver) and report back through
/// [`mark_running`](Self::mark_running) and [`finish`](Self::finish).
pub struct TaskQueue {
    config: TaskQueueConfig,
    sender: flume::Sender<IndexingJob>,
    receiver: flume::Receiver<IndexingJob>,
    next_id: AtomicU64,
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl TaskQueue {
    /// Create a new task queue with the given configuration
    pub fn new(config: TaskQueueConfig) -> Self {
        let (sender, receiver) = flume::bounded(config.max_queue_size.max(1));
        Self {
            config,
            sender,
            receiver,
            next_id: AtomicU64::new(1),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Enqueue a job without waiting. Fails if the queue is full.
    pub async fn submit(&self, document_id: DocumentId, force_regenerate: bool) -> Result<JobId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = IndexingJob::new(id, document_id, force_regenerate);

        let mut jobs = self.jobs.write().await;
        prune(&mut jobs, self.config.result_ttl);

        match self.sender.try_send(job.clone()) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                warn!("Task queue is full, rejecting {}", job.description());
                bail!("task queue is full ({} jobs)", self.config.max_queue_size);
            }
            Err(flume::TrySendError::Disconnected(_)) => bail!("task queue is closed"),
        }

        debug!("Submitted {}", job.description());
        jobs.insert(
            id,
            JobRecord {
                id,
                document_id,
                force_regenerate,
                state: JobState::Queued,
                created_at: job.created_at,
                updated_at: job.created_at,
            },
        );
        Ok(id)
    }

    /// Put a timed-out job back with its retry count increased.
    pub async fn redeliver(&self, mut job: IndexingJob) -> Result<()> {
        job.retry_count += 1;
        let attempt = job.retry_count + 1;
        let id = job.id;
        // Recorded before sending: a worker may pick the job up and mark it running at once.
        self.set_state(id, JobState::Retrying { attempt }).await;
        if let Err(e) = self.sender.try_send(job) {
            bail!("could not redeliver job {id}: {e}");
        }
        Ok(())
    }

    /// A handle workers receive jobs from
    pub fn receiver(&self) -> flume::Receiver<IndexingJob> {
        self.receiver.clone()
    }

    /// Jobs waiting in the channel
    pub fn queue_size(&self) -> usize {
        self.sender.len()
    }

    pub async fn mark_running(&self, job: &IndexingJob) {
        self.set_state(
            job.id,
            JobState::Running {
                attempt: job.retry_count + 1,
            },
        )
        .await;
    }

    pub async fn finish(&self, id: JobId, result: std::result::Result<IndexOutcome, String>) {
        let state = match result {
            Ok(outcome) => JobState::Succeeded { outcome },
            Err(error) => JobState::Failed { error },
        };
        self.set_state(id, state).await;
    }

    async fn set_state(&self, id: JobId, state: JobState) {
        let mut jobs = self.jobs.write().await;
        if let Some(record) = jobs.get_mut(&id) {
            record.state = state;
            record.updated_at = Utc::now();
        }
    }

    pub async fn job_status(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Jobs that are queued, running or waiting for redelivery
    pub async fn unfinished_jobs(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|r| !r.state.is_finished())
            .count()
    }

    /// Drop finished records older than the retention window. Returns how many.
    pub async fn prune_finished(&self) -> usize {
        prune(&mut *self.jobs.write().await, self.config.result_ttl)
    }
}

fn prune(jobs: &mut HashMap<JobId, JobRecord>, ttl: Duration) -> usize {
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return 0;
    };
    let cutoff = Utc::now() - ttl;
    let before = jobs.len();
    jobs.retain(|_, record| !(record.state.is_finished() && record.updated_at < cutoff));
    before - jobs.len()
}
