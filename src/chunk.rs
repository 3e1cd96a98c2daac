//! Sliding-window text chunker.
//!
//! Splits file text into overlapping [`TextChunk`]s of `window_chars`
//! characters, advancing by `window_chars - overlap_chars` each step.
//! Lengths are counted in Unicode scalar values, so multi-byte text never
//! splits inside a character.
//!
//! Each chunk carries its path, its 0-based index and a SHA-256 hash of its
//! text. Output is fully deterministic for a given input and settings.

use sha2::{Digest, Sha256};

use crate::models::TextChunk;

/// Split `text` into overlapping windows.
///
/// Empty text yields no chunks. When `overlap_chars >= window_chars` the step
/// is forced to one character so the cursor always advances. At most
/// `max_chunks` chunks are returned.
pub fn chunk_text(
    path: &str,
    text: &str,
    window_chars: usize,
    overlap_chars: usize,
    max_chunks: usize,
) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len == 0 || max_chunks == 0 {
        return Vec::new();
    }

    let window = window_chars.max(1);
    let step = window.saturating_sub(overlap_chars).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len && chunks.len() < max_chunks {
        let end = (start + window).min(len);
        let piece: String = chars[start..end].iter().collect();
        chunks.push(make_chunk(path, chunks.len() as i64, piece));

        if end == len {
            break;
        }
        start += step;
    }

    chunks
}

/// Expected chunk count for a text of `len` characters, ignoring the cap.
pub fn expected_chunks(len: usize, window_chars: usize, overlap_chars: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let window = window_chars.max(1);
    let step = window.saturating_sub(overlap_chars).max(1);
    if len <= window {
        return 1;
    }
    1 + (len - window).div_ceil(step)
}

fn make_chunk(path: &str, index: i64, text: String) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    TextChunk {
        path: path.to_string(),
        chunk_index: index,
        text,
        hash,
    }
}
