#[cfg(test)]
mod test_suite {
    use super::super::api::StatusApi;
    use super::super::types::HealthStatus;
    use crate::retrieval::indexer::DocumentIndexer;
    use crate::retrieval::indexing_engine::IndexingEngine;
    use crate::retrieval::task_queue::TaskQueueConfig;
    use crate::storage::{ChunkStore, DocumentInput, DocumentStore, NewChunk, SqliteStore};
    use anyhow::Result;
    use axum::routing::get;
    use axum::{Json, Router};
    use half::f16;
    use pagesearch_context::{MarkdownChunker, ChunkerConfig, TokenizerAdapter};
    use pagesearch_embed::{EmbedConfig, HttpEmbeddingClient};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn health_stub(dimension: usize) -> String {
        let app = Router::new().route(
            "/health",
            get(move || async move {
                Json(json!({"status": "healthy", "embedding_dimension": dimension}))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(url: &str, dimension: usize) -> HttpEmbeddingClient {
        let mut config = EmbedConfig::new(url).with_dimension(dimension);
        config.health_timeout_secs = 1;
        HttpEmbeddingClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_get_index_statistics() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        store.ensure_embedding_model("mini", 2).await?;
        let a = store.upsert_document(DocumentInput::new("A", "a")).await?.id;
        store.upsert_document(DocumentInput::new("B", "b")).await?;
        store
            .replace_chunks(
                a,
                vec![NewChunk {
                    chunk_index: 0,
                    chunk_text: "# A\n\na".to_string(),
                    heading_path: String::new(),
                    token_count: 3,
                    embedding: vec![f16::from_f32(1.0), f16::ZERO],
                }],
            )
            .await?;

        let stats = StatusApi::get_index_statistics(&store).await?;
        assert_eq!(stats.total_documents, 2);
        assert_eq!(stats.documents_by_status["completed"], 1);
        assert_eq!(stats.documents_by_status["pending"], 1);
        assert_eq!(stats.documents_by_status["failed"], 0);
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.model_name.as_deref(), Some("mini"));
        assert_eq!(stats.dimension, Some(2));
        assert!(stats.database_size_bytes.unwrap_or(0) > 0);
        assert_eq!(stats.completed_without_chunks, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_empty_index_statistics() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        let stats = StatusApi::get_index_statistics(&store).await?;
        assert_eq!(stats.total_documents, 0);
        assert_eq!(stats.documents_by_status.len(), 4);
        assert_eq!(stats.model_name, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_service_is_a_warning() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        let client = client("http://127.0.0.1:9", 384);

        let status = StatusApi::get_system_status(&store, None, &client).await?;
        assert!(!status.embedding_service.reachable);
        assert!(status.embedding_service.error.is_some());
        assert!(status.embedding_service.dimension_matches);
        assert!(status.workers.is_none());
        assert_eq!(status.overall_status, HealthStatus::Warning);
        Ok(())
    }

    #[tokio::test]
    async fn test_healthy_service() -> Result<()> {
        let url = health_stub(384).await;
        let store = SqliteStore::open_memory().await?;

        let status = StatusApi::get_system_status(&store, None, &client(&url, 384)).await?;
        assert!(status.embedding_service.reachable);
        assert!(status.embedding_service.healthy);
        assert_eq!(status.embedding_service.reported_dimension, Some(384));
        assert_eq!(status.overall_status, HealthStatus::Healthy);
        Ok(())
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_critical() -> Result<()> {
        let url = health_stub(768).await;
        let store = SqliteStore::open_memory().await?;

        let health = StatusApi::get_embedding_health(&client(&url, 384)).await;
        assert!(health.reachable);
        assert!(!health.dimension_matches);

        let status = StatusApi::get_system_status(&store, None, &client(&url, 384)).await?;
        assert_eq!(status.overall_status, HealthStatus::Critical);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_worker_status() -> Result<()> {
        let store = Arc::new(SqliteStore::open_memory().await?);
        let embedder = Arc::new(client("http://127.0.0.1:9", 384));
        let chunker = MarkdownChunker::new(ChunkerConfig::default(), TokenizerAdapter::heuristic());
        let config = TaskQueueConfig {
            max_workers: 2,
            job_timeout: Duration::from_secs(5),
            ..TaskQueueConfig::default()
        };
        let engine = IndexingEngine::new(DocumentIndexer::new(store, embedder, chunker), config);

        let workers = StatusApi::get_worker_status(&engine).await;
        assert_eq!(workers.queue_size, 0);
        assert_eq!(workers.unfinished_jobs, 0);
        assert_eq!(workers.max_workers, 2);
        assert_eq!(workers.documents_indexed, 0);
        Ok(())
    }
}
