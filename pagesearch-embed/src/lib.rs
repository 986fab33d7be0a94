//! # pagesearch-embed
//!
//! Client side of the text embedding capability. Documents are chunked elsewhere; this
//! crate only turns lists of strings into fixed-dimension vectors by calling an
//! external embedding service over HTTP.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pagesearch_embed::{EmbedConfig, EmbeddingProvider, HttpEmbeddingClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = HttpEmbeddingClient::new(EmbedConfig::new("http://localhost:8001"))?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = client.embed_batched(&texts, None, true).await?;
//!
//! println!("Generated {} embeddings of dimension {}", result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: service URL, timeouts, batch size and the index-wide dimension
//! - [`provider`]: the [`EmbeddingProvider`] trait, including order-preserving batching
//! - [`client`]: [`HttpEmbeddingClient`], the HTTP implementation
//! - [`error`]: [`EmbedError`], split into unavailable / bad request / service error
//!
//! Vectors are handed out as `half::f16`, the format they are stored in.

pub mod client;
pub mod config;
pub mod error;
pub mod provider;

// Re-export main types for easy access
pub use client::{HealthStatus, HttpEmbeddingClient, ServiceInfo};
pub use config::{EmbedConfig, EmbedConfigBuilder};
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, EmbeddingResult, MAX_TEXTS_PER_REQUEST};
