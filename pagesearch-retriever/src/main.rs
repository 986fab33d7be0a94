use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use pagesearch_context::{MarkdownChunker, TokenizerAdapter};
use pagesearch_embed::HttpEmbeddingClient;
use pagesearch_retriever::{
    config::PagesearchConfig,
    retrieval::{
        indexer::DocumentIndexer,
        indexing_engine::{IndexingEngine, PendingFilter, ReindexFilter},
    },
    search::{HybridResults, KeywordHit, SearchEngine, SearchRequest, SemanticResults},
    server::{self, AppState},
    status::{StatusApi, SystemStatus},
    storage::{DocumentId, DocumentInput, DocumentStore, DocumentSummary, EmbeddingStatus, SqliteStore},
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Index wiki documents and search them by meaning and by keyword.
#[derive(Parser, Debug)]
#[command(name = "pagesearch", author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file, overrides the configuration
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Embedding service base URL, overrides the configuration
    #[arg(long, global = true)]
    embedding_url: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database and record the embedding model
    Init,
    /// Create or update a document
    Put {
        /// Document id; a new one is allocated when omitted
        #[arg(long)]
        id: Option<DocumentId>,
        #[arg(long)]
        title: String,
        /// Markdown file with the document body
        #[arg(long, conflicts_with = "content")]
        file: Option<PathBuf>,
        /// Document body given inline
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long, default_value_t = 0)]
        collection: i64,
        /// Hide the document from search
        #[arg(long)]
        unpublished: bool,
        /// Index right away instead of leaving the document pending
        #[arg(long)]
        index: bool,
    },
    /// Chunk, embed and store one document now
    Index {
        id: DocumentId,
        /// Rebuild even if chunks exist
        #[arg(long)]
        force: bool,
    },
    /// Reset matching documents to pending and rebuild them
    Reindex {
        #[arg(long, value_enum, default_value_t = ReindexFilter::All)]
        filter: ReindexFilter,
    },
    /// List documents that still need embeddings
    Pending {
        #[arg(long, value_enum, default_value_t = PendingFilter::Pending)]
        status: PendingFilter,
    },
    /// Semantic search over chunks
    Search {
        query: String,
        /// Only search these documents (comma-separated ids)
        #[arg(long, value_delimiter = ',')]
        scope: Option<Vec<DocumentId>>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
        /// Minimum similarity (0.0 to 1.0)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Case-insensitive substring search on title, content and summary
    Keyword {
        query: String,
        #[arg(long, value_delimiter = ',')]
        scope: Option<Vec<DocumentId>>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
    },
    /// Keyword and semantic search fused per document
    Hybrid {
        query: String,
        #[arg(long, value_delimiter = ',')]
        scope: Option<Vec<DocumentId>>,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Weight of the semantic score (0.0 to 1.0)
        #[arg(short = 'w', long)]
        semantic_weight: Option<f32>,
    },
    /// Show index, worker and embedding service status
    Status,
    /// Delete every chunk and mark every document pending
    ResetEmbeddings,
    /// Run the HTTP API with background indexing workers
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = PagesearchConfig::load(args.config.as_deref())?;
    if let Some(database) = &args.database {
        config.database.path = database.clone();
    }
    if let Some(url) = &args.embedding_url {
        config.embedding.service_url = url.clone();
    }
    config.validate()?;

    let app = App::open(config, args.format).await?;
    app.execute(args.command).await
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything a command may need, opened once.
struct App {
    config: PagesearchConfig,
    format: OutputFormat,
    store: Arc<SqliteStore>,
    client: Arc<HttpEmbeddingClient>,
}

impl App {
    async fn open(config: PagesearchConfig, format: OutputFormat) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.database.path).await?);
        let client = Arc::new(HttpEmbeddingClient::new(config.embedding.clone())?);
        Ok(Self {
            config,
            format,
            store,
            client,
        })
    }

    /// Fail early if the index was built with another model.
    async fn check_model(&self) -> Result<()> {
        let embedding = &self.config.embedding;
        self.store
            .ensure_embedding_model(&embedding.model_name, embedding.dimension)
            .await
    }

    fn engine(&self) -> IndexingEngine {
        let chunking = &self.config.chunking;
        let (tokenizer, load_error) =
            TokenizerAdapter::from_optional_file(chunking.tokenizer_path.as_deref());
        if let Some(e) = load_error {
            warn!("{}; counting tokens by word estimate", e);
        }
        let chunker = MarkdownChunker::new(chunking.chunker_config(), tokenizer);
        let indexer = DocumentIndexer::new(self.store.clone(), self.client.clone(), chunker);
        IndexingEngine::new(indexer, self.config.task_queue_config())
    }

    fn search_engine(&self) -> SearchEngine {
        SearchEngine::new(self.store.clone(), self.client.clone(), self.config.search)
    }

    /// The CLI sees every document.
    async fn all_document_ids(&self) -> Result<Vec<DocumentId>> {
        let documents = self.store.list_by_status(&EmbeddingStatus::ALL).await?;
        Ok(documents.into_iter().map(|d| d.id).collect())
    }

    fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Init => {
                self.check_model().await?;
                let documents = self.store.document_count().await?;
                match self.format {
                    OutputFormat::Json => self.print_json(&serde_json::json!({
                        "database": self.config.database.path,
                        "model_name": self.config.embedding.model_name,
                        "dimension": self.config.embedding.dimension,
                        "documents": documents,
                    }))?,
                    OutputFormat::Plain => {
                        println!(
                            "Initialized index at {}",
                            self.config.database.path.display()
                        );
                        println!(
                            "Embedding model: {} ({} dimensions)",
                            self.config.embedding.model_name, self.config.embedding.dimension
                        );
                        println!("Documents: {documents}");
                    }
                }
                Ok(())
            }
            Commands::Put {
                id,
                title,
                file,
                content,
                summary,
                collection,
                unpublished,
                index,
            } => {
                if title.trim().is_empty() {
                    bail!("--title must not be empty");
                }
                let content = match (file, content) {
                    (Some(path), _) => std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?,
                    (None, Some(content)) => content,
                    (None, None) => String::new(),
                };
                let mut input = DocumentInput::new(title, content)
                    .with_collection(collection)
                    .with_published(!unpublished);
                input.summary = summary;
                input.id = id;

                let engine = self.engine();
                let report = engine.put_document(input).await?;
                let succeeded = match (index, report.job_id) {
                    (true, Some(_)) => {
                        self.check_model().await?;
                        engine.start().await;
                        engine.wait_idle().await;
                        engine.shutdown().await;
                        engine.stats().await.documents_failed == 0
                    }
                    _ => true,
                };

                match self.format {
                    OutputFormat::Json => self.print_json(&report)?,
                    OutputFormat::Plain => {
                        println!("Document {} ({:?})", report.document_id, report.event);
                        match report.job_id {
                            Some(_) if index => println!(
                                "Indexing {}",
                                if succeeded { "succeeded" } else { "failed" }
                            ),
                            Some(_) => println!("Pending; run `pagesearch index {}`", report.document_id),
                            None => println!("No reindex needed"),
                        }
                    }
                }
                if !succeeded {
                    bail!("indexing document {} failed", report.document_id);
                }
                Ok(())
            }
            Commands::Index { id, force } => {
                self.check_model().await?;
                let outcome = self.engine().index_now(id, force).await?;
                match self.format {
                    OutputFormat::Json => self.print_json(&outcome)?,
                    OutputFormat::Plain => println!("Document {id}: {outcome:?}"),
                }
                Ok(())
            }
            Commands::Reindex { filter } => {
                self.check_model().await?;
                let engine = self.engine();
                engine.start().await;
                let report = engine.reindex_all(filter).await?;
                engine.wait_idle().await;
                engine.shutdown().await;
                let stats = engine.stats().await;

                match self.format {
                    OutputFormat::Json => self.print_json(&serde_json::json!({
                        "report": report,
                        "stats": stats,
                    }))?,
                    OutputFormat::Plain => {
                        println!(
                            "Enqueued {} documents ({} could not be enqueued)",
                            report.enqueued, report.failed
                        );
                        println!(
                            "Indexed: {} | Skipped: {} | Failed: {} | Chunks: {}",
                            stats.documents_indexed,
                            stats.documents_skipped,
                            stats.documents_failed,
                            stats.chunks_created
                        );
                    }
                }
                Ok(())
            }
            Commands::Pending { status } => {
                let documents = self.engine().list_documents_by_status(status).await?;
                match self.format {
                    OutputFormat::Json => self.print_json(&documents)?,
                    OutputFormat::Plain => print_documents(&documents),
                }
                Ok(())
            }
            Commands::Search {
                query,
                scope,
                limit,
                offset,
                threshold,
            } => {
                self.check_model().await?;
                let request = SearchRequest {
                    scope,
                    limit,
                    offset,
                    threshold,
                    ..SearchRequest::new(query, self.all_document_ids().await?)
                };
                let results = self.search_engine().semantic_search(&request).await?;
                match self.format {
                    OutputFormat::Json => self.print_json(&results)?,
                    OutputFormat::Plain => print_semantic(&results),
                }
                Ok(())
            }
            Commands::Keyword {
                query,
                scope,
                limit,
                offset,
            } => {
                let request = SearchRequest {
                    scope,
                    limit,
                    offset,
                    ..SearchRequest::new(query, self.all_document_ids().await?)
                };
                let hits = self.search_engine().keyword_search(&request).await?;
                match self.format {
                    OutputFormat::Json => self.print_json(&hits)?,
                    OutputFormat::Plain => print_keyword(&hits),
                }
                Ok(())
            }
            Commands::Hybrid {
                query,
                scope,
                limit,
                semantic_weight,
            } => {
                self.check_model().await?;
                let request = SearchRequest {
                    scope,
                    limit,
                    semantic_weight,
                    ..SearchRequest::new(query, self.all_document_ids().await?)
                };
                let results = self.search_engine().hybrid_search(&request).await?;
                match self.format {
                    OutputFormat::Json => self.print_json(&results)?,
                    OutputFormat::Plain => print_hybrid(&results),
                }
                Ok(())
            }
            Commands::Status => {
                let status = StatusApi::get_system_status(&self.store, None, &self.client).await?;
                match self.format {
                    OutputFormat::Json => self.print_json(&status)?,
                    OutputFormat::Plain => print_status(&status),
                }
                Ok(())
            }
            Commands::ResetEmbeddings => {
                let embedding = &self.config.embedding;
                let deleted = self
                    .store
                    .reset_embeddings(&embedding.model_name, embedding.dimension)
                    .await?;
                match self.format {
                    OutputFormat::Json => self.print_json(&serde_json::json!({
                        "chunks_deleted": deleted,
                        "model_name": embedding.model_name,
                        "dimension": embedding.dimension,
                    }))?,
                    OutputFormat::Plain => {
                        println!("Deleted {deleted} chunks; every document is pending");
                        println!("Run `pagesearch reindex` to rebuild the index");
                    }
                }
                Ok(())
            }
            Commands::Serve { bind } => {
                self.check_model().await?;
                let engine = Arc::new(self.engine());
                engine.start().await;
                let state = AppState {
                    store: self.store.clone(),
                    engine,
                    search: Arc::new(self.search_engine()),
                    embed_client: self.client.clone(),
                };
                server::serve(state, bind, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Could not listen for Ctrl-C: {}", e);
                        std::future::pending::<()>().await;
                    }
                })
                .await
            }
        }
    }
}

fn print_documents(documents: &[DocumentSummary]) {
    println!("Found {} documents:", documents.len());
    for document in documents {
        let updated = document
            .embedding_updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  ID: {} | Status: {} | Embedded: {} | Title: {}",
            document.id, document.embedding_status, updated, document.title
        );
    }
}

fn print_semantic(results: &SemanticResults) {
    println!(
        "Found {} chunks in {} documents (showing {} from offset {}):",
        results.total_chunks,
        results.total_documents,
        results.hits.len(),
        results.offset
    );
    for hit in &results.hits {
        println!(
            "  Similarity: {:.3} | Doc: {} | Chunk: {} | {}",
            hit.similarity, hit.document_id, hit.chunk_index, hit.document_title
        );
        if !hit.heading_path.is_empty() {
            println!("    Section: {}", hit.heading_path);
        }
        println!(
            "    {}",
            hit.chunk_text.chars().take(100).collect::<String>().replace('\n', " ")
        );
    }
}

fn print_keyword(hits: &[KeywordHit]) {
    println!("Found {} documents:", hits.len());
    for hit in hits {
        println!("  Score: {:.1} | Doc: {} | {}", hit.score, hit.document_id, hit.title);
    }
}

fn print_hybrid(results: &HybridResults) {
    if results.semantic_degraded {
        println!("Embedding service unavailable; keyword matches only");
    }
    println!(
        "Found {} documents (semantic weight {:.2}):",
        results.hits.len(),
        results.semantic_weight
    );
    for hit in &results.hits {
        println!(
            "  Score: {:.3} (keyword {:.1}, semantic {:.3}) | Doc: {} | {}",
            hit.combined_score, hit.keyword_score, hit.semantic_score, hit.document_id, hit.title
        );
    }
}

fn print_status(status: &SystemStatus) {
    let index = &status.index;
    println!("Pagesearch Status: {:?}", status.overall_status);
    println!("==========================");

    println!("\nIndex:");
    println!("  Documents: {}", index.total_documents);
    for (state, count) in &index.documents_by_status {
        println!("    {state}: {count}");
    }
    println!("  Chunks: {}", index.total_chunks);
    match (&index.model_name, index.dimension) {
        (Some(model), Some(dimension)) => println!("  Model: {model} ({dimension} dimensions)"),
        _ => println!("  Model: not recorded (run `pagesearch init`)"),
    }
    if let Some(size) = index.database_size_bytes {
        println!("  Database size: {size} bytes");
    }
    if index.completed_without_chunks > 0 {
        println!(
            "  Completed without chunks: {}",
            index.completed_without_chunks
        );
    }

    if let Some(workers) = &status.workers {
        println!("\nWorkers:");
        println!("  Queue size: {}", workers.queue_size);
        println!("  Active: {}/{}", workers.active_workers, workers.max_workers);
        println!("  Indexed: {}", workers.documents_indexed);
        println!("  Failed: {}", workers.documents_failed);
    }

    let service = &status.embedding_service;
    println!("\nEmbedding service: {}", service.service_url);
    println!("  Reachable: {}", if service.reachable { "Yes" } else { "No" });
    if let Some(dimension) = service.reported_dimension {
        println!(
            "  Dimension: {} (configured {}){}",
            dimension,
            service.configured_dimension,
            if service.dimension_matches { "" } else { " MISMATCH" }
        );
    }
    if let Some(error) = &service.error {
        println!("  Error: {error}");
    }
}
