//! Token counting for chunk budgets.
//!
//! The chunker never needs token ids, only counts, so everything here sits behind the
//! small [`TokenCounter`] trait. Two implementations exist:
//!
//! - [`WordEstimate`]: `round(words * 0.75)`, used when no tokenizer is configured.
//! - [`HfTokenCounter`]: a HuggingFace `tokenizer.json` loaded through the
//!   `tokenizers` crate.
//!
//! [`TokenizerAdapter`] is the cheap, cloneable handle the rest of the workspace passes
//! around. One adapter is used for a whole chunking run so that budget comparisons stay
//! consistent.
//!
//! ```
//! use pagesearch_context::tokenizer::TokenizerAdapter;
//!
//! let adapter = TokenizerAdapter::heuristic();
//! assert_eq!(adapter.count_tokens("one two three four"), 3);
//! assert_eq!(adapter.count_tokens(""), 0);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokenizers::Tokenizer;

/// Ratio used by the word-count fallback.
pub const WORDS_TO_TOKENS: f64 = 0.75;

/// Errors raised while loading a tokenizer.
#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("tokenizer file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to load tokenizer from {path}: {message}")]
    Load { path: PathBuf, message: String },
}

/// Counts tokens in a span of text.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;

    /// Short identifier, shown in status output.
    fn name(&self) -> &str;
}

/// Heuristic counter: three tokens for every four whitespace-separated words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordEstimate;

impl TokenCounter for WordEstimate {
    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn name(&self) -> &str {
        "word-estimate"
    }
}

/// `round(word_count * 0.75)`.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words as f64 * WORDS_TO_TOKENS).round() as usize
}

/// Counter backed by a HuggingFace tokenizer definition.
pub struct HfTokenCounter {
    tokenizer: Tokenizer,
    name: String,
}

impl std::fmt::Debug for HfTokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenCounter")
            .field("name", &self.name)
            .field("vocab_size", &self.tokenizer.get_vocab_size(true))
            .finish()
    }
}

impl HfTokenCounter {
    /// Load a `tokenizer.json` from disk.
    ///
    /// Truncation and padding are switched off: a chunk that is longer than the model's
    /// window must still report its real length, otherwise the budget check would pass
    /// oversized chunks.
    pub fn from_file(path: &Path) -> Result<Self, TokenizerError> {
        if !path.exists() {
            return Err(TokenizerError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let mut tokenizer = Tokenizer::from_file(path).map_err(|e| TokenizerError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        tokenizer
            .with_truncation(None)
            .map_err(|e| TokenizerError::Load {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        tokenizer.with_padding(None);

        let name = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tokenizer".to_string());

        Ok(Self { tokenizer, name })
    }
}

impl TokenCounter for HfTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            // Encoding only fails on malformed normalizer state; fall back rather than
            // report zero and let an unbounded chunk through.
            Err(_) => estimate_tokens(text),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shared handle over a [`TokenCounter`].
#[derive(Clone)]
pub struct TokenizerAdapter {
    inner: Arc<dyn TokenCounter>,
}

impl std::fmt::Debug for TokenizerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerAdapter")
            .field("counter", &self.inner.name())
            .finish()
    }
}

impl Default for TokenizerAdapter {
    fn default() -> Self {
        Self::heuristic()
    }
}

impl TokenizerAdapter {
    /// Wrap any counter.
    pub fn new(counter: impl TokenCounter + 'static) -> Self {
        Self {
            inner: Arc::new(counter),
        }
    }

    /// The word-count fallback.
    pub fn heuristic() -> Self {
        Self::new(WordEstimate)
    }

    /// Load a HuggingFace tokenizer, failing if it cannot be read.
    pub fn from_tokenizer_file(path: &Path) -> Result<Self, TokenizerError> {
        Ok(Self::new(HfTokenCounter::from_file(path)?))
    }

    /// Use the tokenizer at `path` when given and loadable, otherwise the heuristic.
    ///
    /// The load error is handed back so the caller can log it; this crate does no
    /// logging of its own.
    pub fn from_optional_file(path: Option<&Path>) -> (Self, Option<TokenizerError>) {
        match path {
            None => (Self::heuristic(), None),
            Some(path) => match Self::from_tokenizer_file(path) {
                Ok(adapter) => (adapter, None),
                Err(e) => (Self::heuristic(), Some(e)),
            },
        }
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.inner.count_tokens(text)
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }
}
