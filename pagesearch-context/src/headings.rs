//! Markdown heading index.
//!
//! [`HeadingIndex::parse`] records every ATX (`# Title`) and Setext (`Title` over a
//! `===` or `---` underline) heading with its byte offset and level. Lines inside fenced
//! code blocks are skipped, so a `# comment` in a shell snippet is not a heading.
//!
//! [`HeadingIndex::path_at`] turns any position in the text into a breadcrumb such as
//! `"Install > Linux > From source"`.

use serde::Serialize;

/// Separator placed between the segments of a heading path.
pub const HEADING_SEPARATOR: &str = " > ";

/// A single heading found in the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Heading {
    /// 1 for `#`, 6 for `######`. Setext `===` is 1 and `---` is 2.
    pub level: u8,
    pub text: String,
    /// Byte offset of the heading line.
    pub offset: usize,
}

/// All headings of one document in source order.
#[derive(Debug, Clone, Default)]
pub struct HeadingIndex {
    headings: Vec<Heading>,
}

impl HeadingIndex {
    pub fn parse(text: &str) -> Self {
        let lines = lines_with_offsets(text);
        let mut headings = Vec::new();
        let mut in_fence = false;
        let mut i = 0;

        while i < lines.len() {
            let (offset, line) = lines[i];
            i += 1;

            if is_fence_line(line) {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }

            if let Some((level, heading)) = parse_atx(line) {
                headings.push(Heading {
                    level,
                    text: heading.to_string(),
                    offset,
                });
                continue;
            }

            if line.trim().is_empty() {
                continue;
            }
            if let Some(&(_, next)) = lines.get(i) {
                if let Some(level) = setext_level(next) {
                    headings.push(Heading {
                        level,
                        text: line.trim().to_string(),
                        offset,
                    });
                    // The underline is consumed with its heading.
                    i += 1;
                }
            }
        }

        Self { headings }
    }

    pub fn headings(&self) -> &[Heading] {
        &self.headings
    }

    pub fn is_empty(&self) -> bool {
        self.headings.is_empty()
    }

    /// Breadcrumb of the headings enclosing `offset`.
    ///
    /// Only headings that start strictly before `offset` count, so the path at a
    /// heading's own offset is the path of the section that contains it.
    pub fn path_at(&self, offset: usize) -> String {
        let mut stack: Vec<(u8, &str)> = Vec::new();

        for heading in self.headings.iter().take_while(|h| h.offset < offset) {
            while let Some(&(level, _)) = stack.last() {
                if level >= heading.level {
                    stack.pop();
                } else {
                    break;
                }
            }
            stack.push((heading.level, heading.text.as_str()));
        }

        stack
            .iter()
            .map(|(_, text)| *text)
            .collect::<Vec<_>>()
            .join(HEADING_SEPARATOR)
    }
}

fn lines_with_offsets(text: &str) -> Vec<(usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n')
        .map(|raw| {
            let start = offset;
            offset += raw.len();
            (start, raw.trim_end_matches(['\n', '\r']))
        })
        .collect()
}

pub(crate) fn is_fence_line(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// `#{1,6}` followed by whitespace and non-empty text.
fn parse_atx(line: &str) -> Option<(u8, &str)> {
    let hashes = line.bytes().take_while(|&b| b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with([' ', '\t']) {
        return None;
    }

    let mut heading = rest.trim();
    // Optional closing sequence, only when separated by whitespace: "## Title ##".
    let without_closing = heading.trim_end_matches('#');
    if without_closing.len() < heading.len() && without_closing.ends_with([' ', '\t']) {
        heading = without_closing.trim_end();
    }

    if heading.is_empty() {
        None
    } else {
        Some((hashes as u8, heading))
    }
}

fn setext_level(line: &str) -> Option<u8> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let marker = line.trim();
    if marker.is_empty() {
        None
    } else if marker.bytes().all(|b| b == b'=') {
        Some(1)
    } else if marker.bytes().all(|b| b == b'-') {
        Some(2)
    } else {
        None
    }
}
