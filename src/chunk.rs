//! Paragraph-boundary text chunker.
//!
//! Splits extracted text into [`TextChunk`]s of at most `max_tokens`
//! (approximated as 4 characters per token). Paragraphs (`\n\n`) are packed
//! together until the limit; a paragraph longer than the limit is cut at
//! the last newline or space before it.

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Position within the file, contiguous from 0.
    pub index: usize,
    pub text: String,
}

/// Whitespace-only input yields no chunks.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            pieces.extend(hard_split(para, max_chars).map(str::to_string));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextChunk { index, text })
        .collect()
}

/// Cuts `para` into pieces of at most `max_chars` bytes on char boundaries,
/// preferring a newline or space as the cut point. `max_chars` is at least
/// one full UTF-8 char wide.
fn hard_split(para: &str, max_chars: usize) -> impl Iterator<Item = &str> {
    let mut remaining = para;
    std::iter::from_fn(move || {
        if remaining.is_empty() {
            return None;
        }
        if remaining.len() <= max_chars {
            return Some(std::mem::take(&mut remaining));
        }
        let mut limit = max_chars;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let head = &remaining[..limit];
        let cut = head
            .rfind('\n')
            .or_else(|| head.rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        let (piece, rest) = remaining.split_at(cut);
        remaining = rest.trim_start();
        Some(piece.trim_end())
    })
    .filter(|p| !p.is_empty())
}
