//! pagesearch-retriever: indexing and hybrid retrieval for wiki-style documents
//!
//! Documents (title, markdown content, optional summary) are split into
//! heading-aware chunks, embedded through an external service and stored in SQLite.
//! Queries are answered by exact cosine search over chunk vectors, by keyword
//! matching, or by a weighted fusion of both.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: the per-document indexer, the job queue and the worker pool
//! - **[`search`]**: semantic, keyword and hybrid search
//! - **[`storage`]**: storage traits with the SQLite implementation
//! - **[`status`]**: index, worker and embedding-service diagnostics
//! - **[`server`]**: the axum JSON API
//! - **[`config`]**: layered TOML / environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagesearch_context::{MarkdownChunker, TokenizerAdapter};
//! use pagesearch_embed::{EmbedConfig, HttpEmbeddingClient};
//! use pagesearch_retriever::retrieval::{
//!     indexer::DocumentIndexer,
//!     indexing_engine::IndexingEngine,
//!     task_queue::TaskQueueConfig,
//! };
//! use pagesearch_retriever::storage::{DocumentInput, SqliteStore};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(SqliteStore::open(Path::new("pagesearch.db")).await?);
//! let embedder = Arc::new(HttpEmbeddingClient::new(EmbedConfig::default())?);
//! let chunker = MarkdownChunker::new(Default::default(), TokenizerAdapter::heuristic());
//!
//! let engine = IndexingEngine::new(
//!     DocumentIndexer::new(store, embedder, chunker),
//!     TaskQueueConfig::default(),
//! );
//! engine.start().await;
//! engine.put_document(DocumentInput::new("Onboarding", "# Day one\n\nGet a laptop.")).await?;
//! engine.wait_idle().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! CRUD events → IndexingEngine → TaskQueue → workers → DocumentIndexer
//!                                                         │ chunk → embed → store
//!                                                         ▼
//! Search APIs ← SearchEngine ← SQLite (documents, document_chunks, index_metadata)
//! ```

pub mod config;
pub mod retrieval;
pub mod search;
pub mod server;
pub mod status;
pub mod storage;

pub use config::PagesearchConfig;
pub use retrieval::indexer::{DocumentIndexer, IndexError, IndexOutcome};
pub use retrieval::indexing_engine::IndexingEngine;
pub use search::{SearchEngine, SearchError, SearchRequest};
pub use storage::SqliteStore;
