use clap::Parser;
use pagesearch_context::markdown::{
    ChunkerConfig, DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_TOKENS, MarkdownChunker, TextChunk,
};
use pagesearch_context::tokenizer::TokenizerAdapter;
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

/// Chunk a markdown document and print the chunks as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the markdown file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Document title, rendered at the top of the first chunk.
    #[arg(short, long, default_value = "")]
    title: String,

    /// Maximum tokens per chunk.
    #[arg(short, long, default_value_t = DEFAULT_MAX_TOKENS)]
    max_tokens: usize,

    /// Tokens of each chunk repeated at the start of the next one.
    #[arg(short, long, default_value_t = DEFAULT_OVERLAP_TOKENS)]
    overlap_tokens: usize,

    /// HuggingFace tokenizer.json used for counting. Defaults to a word-count estimate.
    #[arg(long)]
    tokenizer: Option<PathBuf>,
}

#[derive(Serialize)]
struct Output<'a> {
    tokenizer: &'a str,
    chunk_count: usize,
    chunks: &'a [TextChunk],
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let content = if let Some(input_path) = &args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let (tokenizer, load_error) = TokenizerAdapter::from_optional_file(args.tokenizer.as_deref());
    if let Some(e) = load_error {
        eprintln!("warning: {e}; counting tokens by word estimate");
    }

    let chunker = MarkdownChunker::new(
        ChunkerConfig::new(args.max_tokens, args.overlap_tokens),
        tokenizer,
    );
    let chunks = chunker.chunk(&args.title, &content);

    let output = Output {
        tokenizer: chunker.tokenizer().name(),
        chunk_count: chunks.len(),
        chunks: &chunks,
    };
    let json_output = serde_json::to_string_pretty(&output)?;
    println!("{}", json_output);

    Ok(())
}
