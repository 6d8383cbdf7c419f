//! Paragraph-boundary text chunker.
//!
//! Splits module-produced text into [`ChunkDocument`]s no larger than a
//! configurable token budget, on blank-line paragraph boundaries where
//! possible.
//!
//! Chunk ids are derived from the owning file id, the module name and the
//! chunk index, so reprocessing a file overwrites its previous chunks in the
//! search index instead of accumulating new ones.
//!
//! # Algorithm
//!
//! Paragraphs are packed greedily into chunks of at most `max_tokens * 4`
//! bytes. A paragraph that alone is larger than that is cut at newline or
//! space boundaries (or at any character boundary as a last resort).
//!
//! # Example
//!
//! ```rust
//! use filedex_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("0123abcd", "text", "Hello world.\n\nSecond paragraph.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "0123abcd-text-0");
//! ```

use crate::models::ChunkDocument;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// Returns chunks with contiguous indices starting at 0. Empty or
/// whitespace-only text yields no chunks.
pub fn chunk_text(file_id: &str, module: &str, text: &str, max_tokens: usize) -> Vec<ChunkDocument> {
    let mut out = ChunkSink {
        file_id,
        module,
        max_chars: max_tokens.max(1) * CHARS_PER_TOKEN,
        pending: String::new(),
        chunks: Vec::new(),
    };

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if paragraph.len() > out.max_chars {
            out.flush();
            for piece in hard_split(paragraph, out.max_chars) {
                out.emit(piece);
            }
        } else {
            out.append(paragraph);
        }
    }
    out.flush();
    out.chunks
}

/// Deterministic id of chunk `index` of `file_id` produced by `module`.
pub fn chunk_id(file_id: &str, module: &str, index: i64) -> String {
    format!("{}-{}-{}", file_id, module, index)
}

struct ChunkSink<'a> {
    file_id: &'a str,
    module: &'a str,
    max_chars: usize,
    /// Paragraphs joined with blank lines, not yet emitted.
    pending: String,
    chunks: Vec<ChunkDocument>,
}

impl ChunkSink<'_> {
    fn append(&mut self, paragraph: &str) {
        let joined = if self.pending.is_empty() {
            paragraph.len()
        } else {
            self.pending.len() + 2 + paragraph.len()
        };
        if joined > self.max_chars {
            self.flush();
        }
        if !self.pending.is_empty() {
            self.pending.push_str("\n\n");
        }
        self.pending.push_str(paragraph);
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending);
        self.emit(&text);
    }

    fn emit(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let index = self.chunks.len() as i64;
        self.chunks.push(ChunkDocument {
            id: chunk_id(self.file_id, self.module, index),
            file_id: self.file_id.to_string(),
            module: self.module.to_string(),
            index,
            text: text.to_string(),
        });
    }
}

/// Cut an oversized paragraph into pieces of at most `max_chars` bytes,
/// preferring the last newline, then the last space, inside each window.
/// Cuts always land on UTF-8 boundaries and every piece is non-empty.
fn hard_split(paragraph: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = paragraph;
    while !rest.is_empty() {
        let cut = if rest.len() <= max_chars {
            rest.len()
        } else {
            let window = floor_char_boundary(rest, max_chars);
            let preferred = rest[..window]
                .rfind('\n')
                .or_else(|| rest[..window].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(window);
            if preferred == 0 {
                first_char_len(rest)
            } else {
                preferred
            }
        };
        pieces.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    pieces
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    (0..=index.min(s.len()))
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0)
}

fn first_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(s.len())
}
