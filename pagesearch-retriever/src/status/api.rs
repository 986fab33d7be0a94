use anyhow::Result;
use pagesearch_embed::HttpEmbeddingClient;
use std::collections::BTreeMap;
use tracing::debug;

use crate::retrieval::indexing_engine::IndexingEngine;
use crate::storage::{ChunkStore, DocumentStore, EmbeddingStatus, SqliteStore};

use super::types::*;

/// Main status API implementation
pub struct StatusApi;

impl StatusApi {
    /// Get index statistics straight from the database
    pub async fn get_index_statistics(store: &SqliteStore) -> Result<IndexStatistics> {
        let counts = store.status_counts().await?;
        let documents_by_status: BTreeMap<String, usize> = EmbeddingStatus::ALL
            .iter()
            .map(|status| {
                (
                    status.to_string(),
                    counts.get(status).copied().unwrap_or(0),
                )
            })
            .collect();

        let info = store.index_info().await?;
        let database_size_bytes = Self::get_database_size(store).await.ok();

        Ok(IndexStatistics {
            total_documents: documents_by_status.values().sum(),
            documents_by_status,
            total_chunks: store.total_chunks().await?,
            model_name: info.as_ref().map(|i| i.model_name.clone()),
            dimension: info.map(|i| i.dimension),
            database_size_bytes,
            completed_without_chunks: store.completed_without_chunks().await?.len(),
        })
    }

    /// Get worker pool statistics
    pub async fn get_worker_status(engine: &IndexingEngine) -> WorkerStatus {
        let stats = engine.stats().await;
        let queue = engine.queue();

        WorkerStatus {
            queue_size: queue.queue_size(),
            unfinished_jobs: queue.unfinished_jobs().await,
            active_workers: stats.active_workers,
            max_workers: queue.config().max_workers,
            documents_indexed: stats.documents_indexed,
            documents_skipped: stats.documents_skipped,
            documents_failed: stats.documents_failed,
            jobs_timed_out: stats.jobs_timed_out,
            jobs_retried: stats.jobs_retried,
            chunks_created: stats.chunks_created,
        }
    }

    /// Probe the embedding service. Never fails: an unreachable service is reported.
    pub async fn get_embedding_health(client: &HttpEmbeddingClient) -> EmbeddingServiceHealth {
        let config = client.config();
        let mut health = EmbeddingServiceHealth {
            service_url: config.service_url.clone(),
            reachable: false,
            healthy: false,
            reported_dimension: None,
            configured_dimension: config.dimension,
            dimension_matches: true,
            error: None,
        };

        match client.health().await {
            Ok(status) => {
                health.reachable = true;
                health.healthy = status.is_healthy();
                health.reported_dimension = status.embedding_dimension;
                health.dimension_matches = status
                    .embedding_dimension
                    .is_none_or(|dimension| dimension == config.dimension);
            }
            Err(e) => {
                debug!("Embedding service health check failed: {}", e);
                health.error = Some(e.to_string());
            }
        }
        health
    }

    /// Combine everything into one report
    pub async fn get_system_status(
        store: &SqliteStore,
        engine: Option<&IndexingEngine>,
        client: &HttpEmbeddingClient,
    ) -> Result<SystemStatus> {
        let (index, embedding_service) = tokio::join!(
            Self::get_index_statistics(store),
            Self::get_embedding_health(client),
        );
        let index = index?;
        let workers = match engine {
            Some(engine) => Some(Self::get_worker_status(engine).await),
            None => None,
        };

        Ok(SystemStatus {
            overall_status: Self::overall_status(&index, &embedding_service),
            index,
            workers,
            embedding_service,
        })
    }

    fn overall_status(index: &IndexStatistics, service: &EmbeddingServiceHealth) -> HealthStatus {
        let index_mismatch = index
            .dimension
            .is_some_and(|dimension| dimension != service.configured_dimension);
        if !service.dimension_matches || index_mismatch {
            HealthStatus::Critical
        } else if !service.reachable || !service.healthy {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    async fn get_database_size(store: &SqliteStore) -> Result<u64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(store.pool())
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(store.pool())
            .await?;
        Ok((page_count * page_size) as u64)
    }
}
