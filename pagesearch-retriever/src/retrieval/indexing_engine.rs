//! Asynchronous indexing: a worker pool draining the [`TaskQueue`].
//!
//! ## Pipeline Flow
//!
//! ```text
//! on_document_event / enqueue / regenerate / reindex_all
//!                 │
//!                 ▼
//!            TaskQueue (flume, bounded) ──► worker 1..N ──► DocumentIndexer::index
//!                 ▲                              │
//!                 └──── redeliver on timeout ────┘
//! ```
//!
//! Workers run every job under `tokio::time::timeout`. A timed-out job is redelivered
//! up to `max_retries` times; any other failure is terminal for the job and leaves the
//! document `failed`. Embedding calls only ever happen inside workers or in
//! [`IndexingEngine::index_now`].
//!
//! Shutdown goes through a watch channel: workers finish the job they hold and stop
//! taking new ones.

use super::indexer::{DocumentIndexer, IndexError, IndexOutcome};
use super::task_queue::{IndexingJob, JobId, JobRecord, TaskQueue, TaskQueueConfig};
use crate::storage::{
    DocumentId, DocumentInput, DocumentStore, DocumentSummary, EmbeddingStatus, UpsertOutcome,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to a document in the CRUD layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentEvent {
    Created,
    /// Content or title changed
    ContentUpdated,
    /// Anything else changed (publication, summary, collection)
    MetadataUpdated,
}

impl From<&UpsertOutcome> for DocumentEvent {
    fn from(outcome: &UpsertOutcome) -> Self {
        if outcome.created {
            DocumentEvent::Created
        } else if outcome.content_changed {
            DocumentEvent::ContentUpdated
        } else {
            DocumentEvent::MetadataUpdated
        }
    }
}

/// Result of [`IndexingEngine::put_document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutReport {
    pub document_id: DocumentId,
    pub event: DocumentEvent,
    pub job_id: Option<JobId>,
}

/// Which documents [`IndexingEngine::reindex_all`] picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReindexFilter {
    Pending,
    Failed,
    /// Pending and failed
    All,
}

impl ReindexFilter {
    pub fn statuses(&self) -> &'static [EmbeddingStatus] {
        match self {
            ReindexFilter::Pending => &[EmbeddingStatus::Pending],
            ReindexFilter::Failed => &[EmbeddingStatus::Failed],
            ReindexFilter::All => &[EmbeddingStatus::Pending, EmbeddingStatus::Failed],
        }
    }
}

/// Filter for the admin listing of documents that still need embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PendingFilter {
    #[default]
    Pending,
    Processing,
    Failed,
    /// Every status except completed
    All,
}

impl PendingFilter {
    pub fn statuses(&self) -> &'static [EmbeddingStatus] {
        match self {
            PendingFilter::Pending => &[EmbeddingStatus::Pending],
            PendingFilter::Processing => &[EmbeddingStatus::Processing],
            PendingFilter::Failed => &[EmbeddingStatus::Failed],
            PendingFilter::All => &[
                EmbeddingStatus::Pending,
                EmbeddingStatus::Processing,
                EmbeddingStatus::Failed,
            ],
        }
    }
}

/// Result of [`IndexingEngine::reindex_all`]. Jobs are only enqueued, not awaited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub enqueued: usize,
    /// Documents that could not be enqueued
    pub failed: usize,
    pub job_ids: Vec<JobId>,
}

/// Worker counters since the engine was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub documents_indexed: usize,
    pub documents_skipped: usize,
    pub documents_failed: usize,
    pub jobs_timed_out: usize,
    pub jobs_retried: usize,
    pub chunks_created: usize,
    pub active_workers: usize,
}

/// State shared by all workers.
struct WorkerContext {
    indexer: Arc<DocumentIndexer>,
    queue: Arc<TaskQueue>,
    stats: Arc<RwLock<ProcessingStats>>,
    job_finished: Arc<Notify>,
}

/// Queue plus worker pool around a [`DocumentIndexer`].
pub struct IndexingEngine {
    indexer: Arc<DocumentIndexer>,
    queue: Arc<TaskQueue>,
    stats: Arc<RwLock<ProcessingStats>>,
    job_finished: Arc<Notify>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_sender: watch::Sender<bool>,
}

impl IndexingEngine {
    /// Create an engine. No workers run until [`start`](Self::start).
    pub fn new(indexer: DocumentIndexer, config: TaskQueueConfig) -> Self {
        let (shutdown_sender, _) = watch::channel(false);
        Self {
            indexer: Arc::new(indexer),
            queue: Arc::new(TaskQueue::new(config)),
            stats: Arc::new(RwLock::new(ProcessingStats::default())),
            job_finished: Arc::new(Notify::new()),
            workers: Mutex::new(Vec::new()),
            shutdown_sender,
        }
    }

    pub fn indexer(&self) -> &Arc<DocumentIndexer> {
        &self.indexer
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Spawn the worker pool. Calling it again while workers run does nothing.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        self.shutdown_sender.send_replace(false);

        let count = self.queue.config().max_workers.max(1);
        for worker_id in 0..count {
            let context = WorkerContext {
                indexer: self.indexer.clone(),
                queue: self.queue.clone(),
                stats: self.stats.clone(),
                job_finished: self.job_finished.clone(),
            };
            let shutdown = self.shutdown_sender.subscribe();
            workers.push(tokio::spawn(worker_loop(worker_id, context, shutdown)));
        }
        info!("Started {} indexing workers", count);
    }

    /// Index immediately on the caller's task, bypassing the queue.
    pub async fn index_now(
        &self,
        document_id: DocumentId,
        force_regenerate: bool,
    ) -> Result<IndexOutcome, IndexError> {
        self.indexer.index(document_id, force_regenerate).await
    }

    pub async fn enqueue(&self, document_id: DocumentId, force_regenerate: bool) -> Result<JobId> {
        self.queue.submit(document_id, force_regenerate).await
    }

    /// Admin action: reset one document to `pending` and enqueue a forced rebuild.
    pub async fn regenerate(&self, document_id: DocumentId) -> Result<JobId, IndexError> {
        let store = self.indexer.store();
        if store.get_document(document_id).await?.is_none() {
            return Err(IndexError::NotFound(document_id));
        }
        store
            .set_status(document_id, EmbeddingStatus::Pending)
            .await?;
        Ok(self.queue.submit(document_id, true).await?)
    }

    /// React to a CRUD event. Returns the job enqueued, if any.
    pub async fn on_document_event(
        &self,
        document_id: DocumentId,
        event: DocumentEvent,
    ) -> Result<Option<JobId>> {
        let force = match event {
            DocumentEvent::Created => false,
            DocumentEvent::ContentUpdated => true,
            DocumentEvent::MetadataUpdated => {
                debug!("Metadata-only change to document {}, not reindexing", document_id);
                return Ok(None);
            }
        };
        Ok(Some(self.queue.submit(document_id, force).await?))
    }

    /// Write a document and trigger whatever indexing the change calls for.
    pub async fn put_document(&self, input: DocumentInput) -> Result<PutReport> {
        let outcome = self.indexer.store().upsert_document(input).await?;
        let event = DocumentEvent::from(&outcome);
        let job_id = self.on_document_event(outcome.id, event).await?;
        Ok(PutReport {
            document_id: outcome.id,
            event,
            job_id,
        })
    }

    /// Reset every matching document to `pending` and enqueue a forced rebuild of each.
    pub async fn reindex_all(&self, filter: ReindexFilter) -> Result<ReindexReport> {
        let store = self.indexer.store();
        let documents = store.list_by_status(filter.statuses()).await?;
        info!("Reindexing {} documents ({:?})", documents.len(), filter);

        let mut report = ReindexReport::default();
        for document in documents {
            let submitted = match store
                .set_status(document.id, EmbeddingStatus::Pending)
                .await
            {
                Ok(_) => self.queue.submit(document.id, true).await,
                Err(e) => Err(e),
            };
            match submitted {
                Ok(job_id) => {
                    report.enqueued += 1;
                    report.job_ids.push(job_id);
                }
                Err(e) => {
                    warn!("Could not enqueue document {}: {:#}", document.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn list_documents_by_status(
        &self,
        filter: PendingFilter,
    ) -> Result<Vec<DocumentSummary>> {
        self.indexer.store().list_by_status(filter.statuses()).await
    }

    pub async fn job_status(&self, job_id: JobId) -> Option<JobRecord> {
        self.queue.job_status(job_id).await
    }

    pub async fn stats(&self) -> ProcessingStats {
        self.stats.read().await.clone()
    }

    /// Wait until no job is queued, running or awaiting redelivery.
    pub async fn wait_idle(&self) {
        loop {
            let finished = self.job_finished.notified();
            if self.queue.unfinished_jobs().await == 0 {
                return;
            }
            tokio::select! {
                _ = finished => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Stop taking new jobs and wait for in-flight ones.
    pub async fn shutdown(&self) {
        self.shutdown_sender.send_replace(true);
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Indexing worker panicked: {}", e);
            }
        }
        debug!("Indexing engine shut down");
    }
}

async fn worker_loop(worker_id: usize, context: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let receiver = context.queue.receiver();
    debug!("Worker {} started", worker_id);

    loop {
        if *shutdown.borrow() {
            break;
        }
        let job = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            job = receiver.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };
        process_job(&context, job).await;
        context.job_finished.notify_waiters();
    }

    debug!("Worker {} stopped", worker_id);
}

async fn process_job(context: &WorkerContext, job: IndexingJob) {
    let timeout = context.queue.config().job_timeout;
    context.queue.mark_running(&job).await;
    context.stats.write().await.active_workers += 1;
    debug!("Running {}", job.description());

    let result = tokio::time::timeout(
        timeout,
        context.indexer.index(job.document_id, job.force_regenerate),
    )
    .await;

    let mut stats = context.stats.write().await;
    stats.active_workers -= 1;
    match result {
        Ok(Ok(outcome)) => {
            match outcome {
                IndexOutcome::Indexed { chunks } => {
                    stats.documents_indexed += 1;
                    stats.chunks_created += chunks;
                }
                IndexOutcome::Skipped { .. } => stats.documents_skipped += 1,
            }
            drop(stats);
            context.queue.finish(job.id, Ok(outcome)).await;
        }
        Ok(Err(e)) => {
            stats.documents_failed += 1;
            drop(stats);
            context.queue.finish(job.id, Err(e.to_string())).await;
        }
        Err(_) => {
            stats.jobs_timed_out += 1;
            let max_retries = context.queue.config().max_retries;
            if job.should_retry(max_retries) {
                stats.jobs_retried += 1;
                drop(stats);
                warn!("{} timed out after {:?}, redelivering", job.description(), timeout);
                let id = job.id;
                if let Err(e) = context.queue.redeliver(job).await {
                    error!("{:#}", e);
                    context.queue.finish(id, Err(e.to_string())).await;
                }
            } else {
                stats.documents_failed += 1;
                drop(stats);
                error!(
                    "{} timed out after {:?}, giving up after {} retries",
                    job.description(),
                    timeout,
                    max_retries
                );
                // The interrupted run never reached its own failure handling.
                context.indexer.mark_failed(job.document_id).await;
                context
                    .queue
                    .finish(
                        job.id,
                        Err(format!("timed out {} times", job.retry_count + 1)),
                    )
                    .await;
            }
        }
    }
}
