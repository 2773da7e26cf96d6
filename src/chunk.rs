//! Paragraph-boundary text chunker.
//!
//! Splits parsed section text into pieces that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to preserve semantic coherence; oversized paragraphs are hard-split on
//! a newline or space near the limit. An optional overlap carries the tail
//! of each emitted piece into the next one.

use crate::models::DocumentChunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into pieces on paragraph boundaries, respecting `max_tokens`.
///
/// Empty or whitespace-only input yields no pieces.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();
    // Tail of the last emitted piece, prepended to the next one if it fits.
    let mut carry: Option<String> = None;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            carry = overlap_tail(&current_buf, overlap_chars);
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                pieces.push(std::mem::take(&mut current_buf));
            }
            carry = None;
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, remaining.len().min(max_chars));
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                // A single char wider than max_chars still has to make progress.
                let actual_split = if actual_split == 0 {
                    remaining
                        .char_indices()
                        .nth(1)
                        .map(|(i, _)| i)
                        .unwrap_or(remaining.len())
                } else {
                    actual_split
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if current_buf.is_empty() {
                if let Some(tail) = carry.take() {
                    if tail.len() + 2 + trimmed.len() <= max_chars {
                        current_buf.push_str(&tail);
                    }
                }
            }
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.trim().is_empty() {
        pieces.push(current_buf.trim().to_string());
    }

    pieces
}

/// Last `overlap_chars` bytes of `text`, widened to the next word start.
fn overlap_tail(text: &str, overlap_chars: usize) -> Option<String> {
    if overlap_chars == 0 || text.len() <= overlap_chars {
        return None;
    }
    let start = ceil_char_boundary(text, text.len() - overlap_chars);
    let tail = &text[start..];
    let tail = match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    };
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Re-chunk parser output so every chunk fits the configured budget.
///
/// Metadata is inherited from the parsed section; when a section splits
/// into several pieces the section label gains a `#n` suffix.
pub fn split_chunks(
    sections: Vec<DocumentChunk>,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<DocumentChunk> {
    let mut out = Vec::new();
    for section in sections {
        let pieces = chunk_text(&section.text, max_tokens, overlap_tokens);
        let multi = pieces.len() > 1;
        for (i, piece) in pieces.into_iter().enumerate() {
            let mut metadata = section.metadata.clone();
            if multi {
                metadata.page_or_section = Some(match &section.metadata.page_or_section {
                    Some(label) => format!("{} #{}", label, i + 1),
                    None => format!("#{}", i + 1),
                });
            }
            out.push(DocumentChunk {
                text: piece,
                metadata,
            });
        }
    }
    out
}
