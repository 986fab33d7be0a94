//! SQLite implementation of the storage traits.
//!
//! ## Database Schema
//!
//! ```sql
//! -- Documents: owned by the CRUD layer, the pipeline only writes the status columns
//! CREATE TABLE documents (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     collection_id INTEGER NOT NULL,
//!     title TEXT NOT NULL,
//!     content TEXT NOT NULL,
//!     summary TEXT,
//!     is_published INTEGER NOT NULL,
//!     embedding_status TEXT NOT NULL,     -- pending | processing | completed | failed
//!     embedding_updated_at TIMESTAMP,     -- last successful (re)index
//!     created_at TIMESTAMP NOT NULL,
//!     updated_at TIMESTAMP NOT NULL
//! );
//!
//! -- Chunks: one row per chunk, embedding stored as raw f16 values
//! CREATE TABLE document_chunks (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     document_id INTEGER REFERENCES documents(id) ON DELETE CASCADE,
//!     chunk_index INTEGER,                -- 0-based, contiguous per document
//!     chunk_text TEXT,
//!     heading_path TEXT,                  -- "A > B > C" or ""
//!     token_count INTEGER,
//!     embedding BLOB,
//!     created_at TIMESTAMP,
//!     UNIQUE(document_id, chunk_index)
//! );
//!
//! -- Single row describing the vectors in document_chunks
//! CREATE TABLE index_metadata (id INTEGER PRIMARY KEY CHECK (id = 1), model_name, dimension, ...);
//! ```
//!
//! Vector search is an exact scan: scoped rows are streamed and scored in Rust.
//! Scoping binds the accessible ids as one JSON array and expands it with `json_each`.

use super::{
    ChunkMatch, ChunkStore, Document, DocumentId, DocumentInput, DocumentStore, DocumentSummary,
    EmbeddingStatus, KeywordMatch, NewChunk, SearchStore, StoredChunk, UpsertOutcome,
    cosine_distance,
};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use half::f16;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Model and dimension the stored vectors were produced with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexInfo {
    pub model_name: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed [`DocumentStore`], [`ChunkStore`] and [`SearchStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true)
                .page_size(1 << 16)
                .optimize_on_close(true, 1 << 10),
        )
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
        Self::new_with_pool(pool).await
    }

    /// In-memory database for tests. Every connection of a pool would get its own
    /// empty database, so the pool holds exactly one that never expires.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_id INTEGER NOT NULL DEFAULT 0,
                title TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                summary TEXT,
                is_published INTEGER NOT NULL DEFAULT 1,
                embedding_status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (embedding_status IN ('pending', 'processing', 'completed', 'failed')),
                embedding_updated_at TIMESTAMP,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_text TEXT NOT NULL,
                heading_path TEXT NOT NULL DEFAULT '',
                token_count INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                created_at TIMESTAMP NOT NULL,
                CONSTRAINT unique_document_chunk UNIQUE(document_id, chunk_index),
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                model_name TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_document_chunks_document ON document_chunks(document_id)",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(embedding_status)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Get the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn index_info(&self) -> Result<Option<IndexInfo>> {
        let row = sqlx::query(
            "SELECT model_name, dimension, created_at, updated_at FROM index_metadata WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<IndexInfo> {
            Ok(IndexInfo {
                model_name: row.try_get("model_name")?,
                dimension: row.try_get::<i64, _>("dimension")? as usize,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    /// Record the embedding model on first use, and refuse a different one afterwards.
    ///
    /// Vectors from different models are not comparable, so switching models needs
    /// [`reset_embeddings`](Self::reset_embeddings) followed by a full reindex.
    pub async fn ensure_embedding_model(&self, model_name: &str, dimension: usize) -> Result<()> {
        match self.index_info().await? {
            Some(info) if info.model_name == model_name && info.dimension == dimension => Ok(()),
            Some(info) => bail!(
                "index holds {}-dimensional vectors from {:?}, configured model is {:?} ({} dimensions); \
                 run `reset-embeddings` and reindex",
                info.dimension,
                info.model_name,
                model_name,
                dimension
            ),
            None => {
                self.write_index_info(model_name, dimension).await?;
                tracing::info!("Recorded embedding model {} ({} dimensions)", model_name, dimension);
                Ok(())
            }
        }
    }

    async fn write_index_info(&self, model_name: &str, dimension: usize) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO index_metadata (id, model_name, dimension, created_at, updated_at)
            VALUES (1, ?1, ?2, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET
                model_name = excluded.model_name,
                dimension = excluded.dimension,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(model_name)
        .bind(dimension as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every chunk, set every document `pending` and record a new model.
    ///
    /// Returns the number of chunks deleted.
    pub async fn reset_embeddings(&self, model_name: &str, dimension: usize) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM document_chunks")
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        sqlx::query("UPDATE documents SET embedding_status = 'pending', embedding_updated_at = NULL")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO index_metadata (id, model_name, dimension, created_at, updated_at)
            VALUES (1, ?1, ?2, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET
                model_name = excluded.model_name,
                dimension = excluded.dimension,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(model_name)
        .bind(dimension as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!("Reset embeddings: {} chunks deleted", deleted);
        Ok(deleted)
    }

    pub async fn document_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Documents marked `completed` that have no chunks. Every indexed document has at
    /// least one chunk, so these come from writes outside the pipeline.
    pub async fn completed_without_chunks(&self) -> Result<Vec<DocumentId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT d.id FROM documents d
            WHERE d.embedding_status = 'completed'
              AND NOT EXISTS (SELECT 1 FROM document_chunks c WHERE c.document_id = d.id)
            ORDER BY d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn encode_embedding(embedding: &[f16]) -> &[u8] {
    bytemuck::cast_slice::<f16, u8>(embedding)
}

// BLOB buffers are only byte-aligned, so read each value unaligned.
fn decode_embedding(bytes: &[u8]) -> Vec<f16> {
    bytes
        .chunks_exact(2)
        .map(bytemuck::pod_read_unaligned::<f16>)
        .collect()
}

fn scope_json(scope: &[DocumentId]) -> Result<String> {
    Ok(serde_json::to_string(scope)?)
}

/// `%keyword%` with LIKE wildcards escaped by `\`.
fn like_pattern(keyword: &str) -> String {
    let mut pattern = String::with_capacity(keyword.len() + 2);
    pattern.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn status_column(row: &SqliteRow) -> Result<EmbeddingStatus> {
    let status: String = row.try_get("embedding_status")?;
    status.parse()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        collection_id: row.try_get("collection_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        summary: row.try_get("summary")?,
        is_published: row.try_get("is_published")?,
        embedding_status: status_column(row)?,
        embedding_updated_at: row.try_get("embedding_updated_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<StoredChunk> {
    Ok(StoredChunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_index: row.try_get::<i64, _>("chunk_index")? as usize,
        chunk_text: row.try_get("chunk_text")?,
        heading_path: row.try_get("heading_path")?,
        token_count: row.try_get::<i64, _>("token_count")? as usize,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT id, collection_id, title, content, summary, is_published,
                   embedding_status, embedding_updated_at, updated_at
            FROM documents WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    async fn upsert_document(&self, input: DocumentInput) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = match input.id {
            Some(id) => sqlx::query("SELECT title, content FROM documents WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| -> Result<(String, String)> {
                    Ok((row.try_get("title")?, row.try_get("content")?))
                })
                .transpose()?,
            None => None,
        };

        let outcome = match (input.id, existing) {
            (Some(id), Some((title, content))) => {
                let content_changed = title != input.title || content != input.content;
                sqlx::query(
                    r#"
                    UPDATE documents SET
                        collection_id = ?1,
                        title = ?2,
                        content = ?3,
                        summary = ?4,
                        is_published = ?5,
                        updated_at = ?6,
                        embedding_status = CASE WHEN ?7 THEN 'pending' ELSE embedding_status END
                    WHERE id = ?8
                    "#,
                )
                .bind(input.collection_id)
                .bind(&input.title)
                .bind(&input.content)
                .bind(&input.summary)
                .bind(input.is_published)
                .bind(now)
                .bind(content_changed)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome {
                    id,
                    created: false,
                    content_changed,
                }
            }
            (id, _) => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO documents
                        (id, collection_id, title, content, summary, is_published,
                         embedding_status, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)
                    "#,
                )
                .bind(id)
                .bind(input.collection_id)
                .bind(&input.title)
                .bind(&input.content)
                .bind(&input.summary)
                .bind(input.is_published)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome {
                    id: id.unwrap_or_else(|| result.last_insert_rowid()),
                    created: true,
                    content_changed: true,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn set_status(&self, id: DocumentId, status: EmbeddingStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE documents SET embedding_status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, id: DocumentId) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET embedding_status = 'completed', embedding_updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_status(&self, statuses: &[EmbeddingStatus]) -> Result<Vec<DocumentSummary>> {
        let names: Vec<&str> = statuses.iter().map(EmbeddingStatus::as_str).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, collection_id, title, embedding_status, embedding_updated_at, updated_at
            FROM documents
            WHERE embedding_status IN (SELECT value FROM json_each(?1))
            ORDER BY updated_at DESC, id ASC
            "#,
        )
        .bind(serde_json::to_string(&names)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DocumentSummary> {
                Ok(DocumentSummary {
                    id: row.try_get("id")?,
                    collection_id: row.try_get("collection_id")?,
                    title: row.try_get("title")?,
                    embedding_status: status_column(row)?,
                    embedding_updated_at: row.try_get("embedding_updated_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn status_counts(&self) -> Result<HashMap<EmbeddingStatus, usize>> {
        let rows = sqlx::query(
            "SELECT embedding_status, COUNT(*) AS n FROM documents GROUP BY embedding_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in &rows {
            counts.insert(status_column(row)?, row.try_get::<i64, _>("n")? as usize);
        }
        Ok(counts)
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn count_chunks(&self, document_id: DocumentId) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_id = ?1")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn get_chunks(&self, document_id: DocumentId) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, chunk_text, heading_path, token_count, created_at
            FROM document_chunks
            WHERE document_id = ?1
            ORDER BY chunk_index
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn replace_chunks(&self, document_id: DocumentId, chunks: Vec<NewChunk>) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM document_chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in &chunks {
            sqlx::query(
                r#"
                INSERT INTO document_chunks
                    (document_id, chunk_index, chunk_text, heading_path, token_count, embedding, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(document_id)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.chunk_text)
            .bind(&chunk.heading_path)
            .bind(chunk.token_count as i64)
            .bind(encode_embedding(&chunk.embedding))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let updated = sqlx::query(
            "UPDATE documents SET embedding_status = 'completed', embedding_updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls it back.
            bail!("document {document_id} disappeared while its chunks were being replaced");
        }

        tx.commit().await?;
        Ok(chunks.len())
    }

    async fn total_chunks(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl SearchStore for SqliteStore {
    async fn nearest_chunks(&self, query: &[f16], scope: &[DocumentId]) -> Result<Vec<ChunkMatch>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }

        let scope = scope_json(scope)?;
        let mut rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.chunk_index, c.chunk_text, c.heading_path, c.embedding,
                   d.title, d.summary, d.collection_id
            FROM document_chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.is_published = 1
              AND c.document_id IN (SELECT value FROM json_each(?1))
            "#,
        )
        .bind(&scope)
        .fetch(&self.pool);

        let mut matches = Vec::new();
        let mut skipped = 0usize;
        while let Some(row) = rows.try_next().await? {
            let bytes: Vec<u8> = row.try_get("embedding")?;
            let embedding = decode_embedding(&bytes);
            if embedding.len() != query.len() {
                skipped += 1;
                continue;
            }
            matches.push(ChunkMatch {
                chunk_id: row.try_get("id")?,
                document_id: row.try_get("document_id")?,
                document_title: row.try_get("title")?,
                document_summary: row.try_get("summary")?,
                collection_id: row.try_get("collection_id")?,
                chunk_index: row.try_get::<i64, _>("chunk_index")? as usize,
                chunk_text: row.try_get("chunk_text")?,
                heading_path: row.try_get("heading_path")?,
                distance: cosine_distance(query, &embedding),
            });
        }
        if skipped > 0 {
            tracing::warn!(
                "Skipped {} chunks whose dimension differs from the query ({})",
                skipped,
                query.len()
            );
        }

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.document_id.cmp(&b.document_id))
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        Ok(matches)
    }

    async fn keyword_matches(
        &self,
        keyword: &str,
        scope: &[DocumentId],
        limit: usize,
    ) -> Result<Vec<KeywordMatch>> {
        if scope.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, title, summary, collection_id,
                   (title LIKE ?2 ESCAPE '\') AS title_match
            FROM documents
            WHERE is_published = 1
              AND id IN (SELECT value FROM json_each(?1))
              AND (title LIKE ?2 ESCAPE '\'
                   OR content LIKE ?2 ESCAPE '\'
                   OR COALESCE(summary, '') LIKE ?2 ESCAPE '\')
            ORDER BY title_match DESC, id ASC
            LIMIT ?3
            "#,
        )
        .bind(scope_json(scope)?)
        .bind(like_pattern(keyword))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<KeywordMatch> {
                Ok(KeywordMatch {
                    document_id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    summary: row.try_get("summary")?,
                    collection_id: row.try_get("collection_id")?,
                    title_match: row.try_get::<i64, _>("title_match")? != 0,
                })
            })
            .collect()
    }
}
