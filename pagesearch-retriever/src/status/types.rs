use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What is stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatistics {
    /// Total documents, any status
    pub total_documents: usize,
    /// Documents per embedding status, every status present
    pub documents_by_status: BTreeMap<String, usize>,
    /// Total chunk rows
    pub total_chunks: usize,
    /// Embedding model recorded for the stored vectors
    pub model_name: Option<String>,
    /// Vector dimension recorded for the stored vectors
    pub dimension: Option<usize>,
    /// `page_count * page_size`
    pub database_size_bytes: Option<u64>,
    /// Documents marked completed with no chunks
    pub completed_without_chunks: usize,
}

/// Worker pool activity since the engine started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Jobs waiting in the channel
    pub queue_size: usize,
    /// Jobs queued, running or awaiting redelivery
    pub unfinished_jobs: usize,
    pub active_workers: usize,
    pub max_workers: usize,
    pub documents_indexed: usize,
    pub documents_skipped: usize,
    pub documents_failed: usize,
    pub jobs_timed_out: usize,
    pub jobs_retried: usize,
    pub chunks_created: usize,
}

/// Reachability of the embedding service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingServiceHealth {
    pub service_url: String,
    pub reachable: bool,
    pub healthy: bool,
    /// Dimension the service reports in `/health`
    pub reported_dimension: Option<usize>,
    /// Dimension vectors must have in this index
    pub configured_dimension: usize,
    /// `false` only when the service reports a different dimension
    pub dimension_matches: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Everything `pagesearch status` and `GET /api/status` report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub overall_status: HealthStatus,
    pub index: IndexStatistics,
    /// Absent when no worker pool runs in this process
    pub workers: Option<WorkerStatus>,
    pub embedding_service: EmbeddingServiceHealth,
}
