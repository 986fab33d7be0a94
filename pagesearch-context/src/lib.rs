//! pagesearch-context: token counting and structure-aware markdown chunking.
//!
//! - [`tokenizer`]: the token-count adapter with a HuggingFace backend and a word-count
//!   fallback
//! - [`headings`]: ATX/Setext heading index and heading-path lookup
//! - [`markdown`]: the chunker that turns a titled document into overlapping,
//!   token-bounded [`TextChunk`]s

pub mod headings;
pub mod markdown;
pub mod tokenizer;

pub use headings::{HEADING_SEPARATOR, Heading, HeadingIndex};
pub use markdown::{ChunkerConfig, MarkdownChunker, TextChunk, chunk_markdown};
pub use tokenizer::{TokenCounter, TokenizerAdapter, TokenizerError};
