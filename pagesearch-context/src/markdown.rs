//! Structure-aware chunking of markdown documents.
//!
//! A document is cut into token-bounded, overlapping chunks that respect its shape:
//!
//! *   **Paragraphs first**: text is split on blank lines and paragraphs are packed
//!     greedily into a chunk until the next one would overflow `max_tokens`.
//! *   **Sentences when needed**: a paragraph that is larger than the whole budget on
//!     its own is split at sentence ends (`.`, `!`, `?` followed by whitespace) and
//!     the sentences are packed the same way.
//! *   **Code stays whole**: blank lines inside a fenced code block never split it,
//!     and a paragraph holding a fence is never cut into sentences.
//! *   **Overlap**: every chunk after the first starts with the tail of its
//!     predecessor, up to `overlap_tokens` tokens.
//! *   **Heading paths**: each chunk records the breadcrumb of the headings above the
//!     first text it adds, e.g. `"Install > Linux"`. Text carried over as overlap does
//!     not count.
//!
//! The first chunk is prefixed with `# {title}` so the embedding carries the page
//! title. The title line is never repeated in an overlap.
//!
//! A unit that is larger than `max_tokens` by itself (one very long sentence, one big
//! code block) is emitted whole. Nothing in the text is ever dropped.
//!
//! ```
//! use pagesearch_context::markdown::{ChunkerConfig, MarkdownChunker};
//! use pagesearch_context::tokenizer::TokenizerAdapter;
//!
//! let chunker = MarkdownChunker::new(ChunkerConfig::default(), TokenizerAdapter::heuristic());
//! let chunks = chunker.chunk("Guide", "# Setup\n\nRun the installer.\n\n## Linux\n\nUse apt.");
//!
//! assert_eq!(chunks.len(), 1);
//! assert!(chunks[0].chunk_text.starts_with("# Guide\n\n# Setup"));
//! assert_eq!(chunks[0].heading_path, "");
//! ```

use std::borrow::Cow;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::headings::{HeadingIndex, is_fence_line};
use crate::tokenizer::TokenizerAdapter;

pub const DEFAULT_MAX_TOKENS: usize = 256;
pub const DEFAULT_OVERLAP_TOKENS: usize = 50;

const PARAGRAPH_GLUE: &str = "\n\n";

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("fenced block pattern is valid"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("blank line pattern is valid"));
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+\s+").expect("sentence end pattern is valid"));

/// Token budgets for one chunking run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Upper bound on a chunk's token count, except for indivisible units.
    pub max_tokens: usize,
    /// Budget for the tail of one chunk repeated at the start of the next.
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

impl ChunkerConfig {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens,
            overlap_tokens,
        }
    }

    pub fn with_max_tokens(self, max_tokens: usize) -> Self {
        Self { max_tokens, ..self }
    }

    pub fn with_overlap_tokens(self, overlap_tokens: usize) -> Self {
        Self {
            overlap_tokens,
            ..self
        }
    }
}

/// One chunk of a document, ready to be embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Zero-based position within the document.
    pub chunk_index: usize,
    pub chunk_text: String,
    /// Headings enclosing the chunk's first line, joined by `" > "`. Empty if none.
    pub heading_path: String,
    /// Token count of `chunk_text` as measured by the chunker's tokenizer.
    pub token_count: usize,
}

/// Markdown chunker bound to one tokenizer and one set of budgets.
#[derive(Debug, Clone)]
pub struct MarkdownChunker {
    config: ChunkerConfig,
    tokenizer: TokenizerAdapter,
}

impl MarkdownChunker {
    /// A `max_tokens` of zero is treated as one.
    pub fn new(config: ChunkerConfig, tokenizer: TokenizerAdapter) -> Self {
        let config = ChunkerConfig {
            max_tokens: config.max_tokens.max(1),
            ..config
        };
        Self { config, tokenizer }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &TokenizerAdapter {
        &self.tokenizer
    }

    /// Split `text` into chunks, the first of which carries `title`.
    ///
    /// Deterministic: the same title, text, budgets and tokenizer always give the same
    /// chunks.
    pub fn chunk(&self, title: &str, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            let title = title.trim();
            return vec![TextChunk {
                chunk_index: 0,
                chunk_text: title.to_string(),
                heading_path: String::new(),
                token_count: self.tokenizer.count_tokens(title),
            }];
        }

        let headings = HeadingIndex::parse(text);
        let mut packer = Packer {
            chunker: self,
            headings: &headings,
            buffer: Buffer::default(),
            chunks: Vec::new(),
        };

        let title = title.trim();
        if !title.is_empty() {
            let line = format!("# {title}");
            let tokens = self.tokenizer.count_tokens(&line);
            packer.buffer.push(Unit {
                text: Cow::Owned(line),
                glue: "",
                offset: None,
                tokens,
                carried: false,
            });
        }

        for paragraph in split_paragraphs(text) {
            let unit = self.unit(paragraph, PARAGRAPH_GLUE);
            if unit.tokens > self.config.max_tokens && !contains_fence(paragraph.text) {
                let sentences = split_sentences(paragraph);
                if sentences.len() > 1 {
                    let mut sentences = sentences.into_iter().map(|(span, glue)| self.unit(span, glue));
                    if let Some(first) = sentences.next() {
                        if packer.buffer.has_content() {
                            packer.break_before(&first);
                        }
                        packer.add(first);
                    }
                    for sentence in sentences {
                        packer.add(sentence);
                    }
                    continue;
                }
            }
            packer.add(unit);
        }

        packer.finish()
    }

    fn unit<'a>(&self, span: Span<'a>, glue: &'a str) -> Unit<'a> {
        Unit {
            text: Cow::Borrowed(span.text),
            glue,
            offset: Some(span.offset),
            tokens: self.tokenizer.count_tokens(span.text),
            carried: false,
        }
    }
}

/// Chunk with the heuristic tokenizer.
pub fn chunk_markdown(
    title: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<TextChunk> {
    MarkdownChunker::new(
        ChunkerConfig::new(max_tokens, overlap_tokens),
        TokenizerAdapter::heuristic(),
    )
    .chunk(title, text)
}

/// A trimmed slice of the source text and its byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span<'a> {
    pub text: &'a str,
    pub offset: usize,
}

impl<'a> Span<'a> {
    fn trimmed(source: &'a str, range: Range<usize>) -> Option<Self> {
        let raw = &source[range.clone()];
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        let lead = raw.len() - raw.trim_start().len();
        Some(Self {
            text,
            offset: range.start + lead,
        })
    }
}

/// Paragraphs separated by blank lines, ignoring blank lines inside fenced blocks.
pub(crate) fn split_paragraphs(text: &str) -> Vec<Span<'_>> {
    let fences: Vec<Range<usize>> = FENCED_BLOCK.find_iter(text).map(|m| m.range()).collect();
    let inside_fence =
        |sep: &Range<usize>| fences.iter().any(|f| sep.start < f.end && sep.end > f.start);

    let mut paragraphs = Vec::new();
    let mut start = 0;
    for sep in BLANK_LINES.find_iter(text).map(|m| m.range()) {
        if inside_fence(&sep) {
            continue;
        }
        paragraphs.extend(Span::trimmed(text, start..sep.start));
        start = sep.end;
    }
    paragraphs.extend(Span::trimmed(text, start..text.len()));
    paragraphs
}

/// Sentences of one paragraph, each paired with the whitespace that preceded it.
///
/// The first sentence gets the paragraph separator so that a chunk rebuilt from the
/// sentences reads exactly like the source.
fn split_sentences(paragraph: Span<'_>) -> Vec<(Span<'_>, &str)> {
    let text = paragraph.text;
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut glue: &str = PARAGRAPH_GLUE;

    for end in SENTENCE_END.find_iter(text) {
        let sentence = text[start..end.end()].trim_end();
        if !sentence.is_empty() {
            sentences.push((
                Span {
                    text: sentence,
                    offset: paragraph.offset + start,
                },
                glue,
            ));
            glue = &text[start + sentence.len()..end.end()];
        }
        start = end.end();
    }
    if start < text.len() {
        sentences.push((
            Span {
                text: &text[start..],
                offset: paragraph.offset + start,
            },
            glue,
        ));
    }
    sentences
}

fn contains_fence(text: &str) -> bool {
    text.lines().any(is_fence_line)
}

/// A paragraph, sentence, overlap tail or the title line.
#[derive(Debug, Clone)]
struct Unit<'a> {
    text: Cow<'a, str>,
    /// Whitespace placed before this unit when it is not the first in a buffer.
    glue: &'a str,
    /// Byte offset in the source; `None` for the title line.
    offset: Option<usize>,
    tokens: usize,
    /// Copied from the previous chunk as overlap.
    carried: bool,
}

#[derive(Debug, Default)]
struct Buffer<'a> {
    units: Vec<Unit<'a>>,
    text: String,
}

impl<'a> Buffer<'a> {
    fn push(&mut self, unit: Unit<'a>) {
        if !self.text.is_empty() {
            self.text.push_str(unit.glue);
        }
        self.text.push_str(&unit.text);
        self.units.push(unit);
    }

    fn with(&self, unit: &Unit<'a>) -> String {
        join_units(self.units.iter().chain(std::iter::once(unit)))
    }

    fn has_content(&self) -> bool {
        self.units.iter().any(|u| u.offset.is_some())
    }

    /// Offset of the first text this buffer adds beyond its overlap.
    fn first_offset(&self) -> Option<usize> {
        self.units
            .iter()
            .filter(|u| !u.carried)
            .find_map(|u| u.offset)
            .or_else(|| self.units.iter().find_map(|u| u.offset))
    }
}

fn join_units<'u, 'a: 'u>(units: impl IntoIterator<Item = &'u Unit<'a>>) -> String {
    let mut text = String::new();
    for unit in units {
        if !text.is_empty() {
            text.push_str(unit.glue);
        }
        text.push_str(&unit.text);
    }
    text
}

/// Greedy accumulator that turns units into chunks.
struct Packer<'c, 'a> {
    chunker: &'c MarkdownChunker,
    headings: &'c HeadingIndex,
    buffer: Buffer<'a>,
    chunks: Vec<TextChunk>,
}

impl<'a> Packer<'_, 'a> {
    fn max_tokens(&self) -> usize {
        self.chunker.config.max_tokens
    }

    fn count(&self, text: &str) -> usize {
        self.chunker.tokenizer.count_tokens(text)
    }

    fn add(&mut self, unit: Unit<'a>) {
        if self.buffer.has_content() && self.count(&self.buffer.with(&unit)) > self.max_tokens() {
            self.break_before(&unit);
        }
        self.buffer.push(unit);
    }

    /// Flush the buffer and seed the next one with an overlap that leaves room for `next`.
    fn break_before(&mut self, next: &Unit<'a>) {
        let flushed = self.flush();
        for unit in self.overlap(&flushed, next) {
            self.buffer.push(unit);
        }
    }

    /// Emit the buffer as a chunk and return its content units.
    fn flush(&mut self) -> Vec<Unit<'a>> {
        let buffer = std::mem::take(&mut self.buffer);
        let heading_path = buffer
            .first_offset()
            .map(|offset| self.headings.path_at(offset))
            .unwrap_or_default();
        let token_count = self.count(&buffer.text);

        self.chunks.push(TextChunk {
            chunk_index: self.chunks.len(),
            chunk_text: buffer.text,
            heading_path,
            token_count,
        });

        buffer
            .units
            .into_iter()
            .filter(|u| u.offset.is_some())
            .collect()
    }

    /// Trailing units of `flushed` within the overlap budget.
    ///
    /// At most all of `flushed`, and never so much that `next` no longer fits. When no
    /// whole unit qualifies, the longest word tail of the last unit is used instead.
    fn overlap(&self, flushed: &[Unit<'a>], next: &Unit<'a>) -> Vec<Unit<'a>> {
        let budget = self.chunker.config.overlap_tokens;
        if budget == 0 || flushed.is_empty() {
            return Vec::new();
        }

        let mut taken = 0;
        let mut start = flushed.len();
        for (i, unit) in flushed.iter().enumerate().rev() {
            if taken + unit.tokens > budget {
                break;
            }
            taken += unit.tokens;
            start = i;
        }
        let mut overlap: Vec<Unit<'a>> = flushed[start..]
            .iter()
            .cloned()
            .map(|u| Unit { carried: true, ..u })
            .collect();

        while !overlap.is_empty() {
            let candidate = join_units(overlap.iter().chain(std::iter::once(next)));
            if self.count(&candidate) <= self.max_tokens() {
                return overlap;
            }
            overlap.remove(0);
        }

        flushed
            .last()
            .and_then(|last| self.word_tail(last, next, budget))
            .into_iter()
            .collect()
    }

    /// Longest proper word suffix of `unit` that fits the overlap budget and leaves
    /// room for `next`.
    fn word_tail(&self, unit: &Unit<'a>, next: &Unit<'a>, budget: usize) -> Option<Unit<'a>> {
        let text = unit.text.as_ref();
        let word_starts: Vec<usize> = text
            .char_indices()
            .filter(|&(i, c)| {
                !c.is_whitespace() && (i == 0 || text[..i].ends_with(char::is_whitespace))
            })
            .map(|(i, _)| i)
            .collect();

        let mut best = None;
        for words in 1..word_starts.len() {
            let start = word_starts[word_starts.len() - words];
            let tail = &text[start..];
            let tail_tokens = self.count(tail);
            if tail_tokens > budget {
                break;
            }
            let candidate = format!("{tail}{}{}", next.glue, next.text);
            if self.count(&candidate) > self.max_tokens() {
                break;
            }
            best = Some((start, tail_tokens));
        }

        best.map(|(start, tokens)| Unit {
            text: Cow::Owned(text[start..].to_string()),
            glue: "",
            offset: unit.offset.map(|o| o + start),
            tokens,
            carried: true,
        })
    }

    fn finish(mut self) -> Vec<TextChunk> {
        if self.buffer.has_content() || self.chunks.is_empty() {
            self.flush();
        }
        self.chunks
    }
}
