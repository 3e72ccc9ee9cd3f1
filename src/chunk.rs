//! Paragraph-aware text chunker.
//!
//! Packs paragraphs (split on `\n\n`) into chunks of at most `chunk_size`
//! characters. Each chunk after the first is seeded with the trailing
//! `overlap` characters of its predecessor, shortened when needed so the
//! chunk still fits. Paragraphs longer than `chunk_size` are hard split,
//! preferring the last whitespace inside the window.
//!
//! Sizes count `char`s, not bytes, so multi-byte text never splits inside a
//! code point.

/// A chunk of a loaded source's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub unique_id: String,
    pub index: i64,
    pub text: String,
}

const PARAGRAPH_SEP: &str = "\n\n";

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`th char, or the end of the string.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// The last `n` chars of `s`.
fn tail(s: &str, n: usize) -> &str {
    let len = char_len(s);
    if n >= len {
        s
    } else {
        &s[byte_offset(s, len - n)..]
    }
}

fn split_long(paragraph: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = paragraph;
    while char_len(rest) > max {
        let cut = byte_offset(rest, max);
        let split = rest[..cut]
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .unwrap_or(cut);
        let piece = rest[..split].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        rest = rest[split..].trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Split `text` into chunks with contiguous indices starting at 0.
/// Whitespace-only text yields no chunks.
pub fn chunk_text(unique_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size.saturating_sub(1));

    let pieces: Vec<&str> = text
        .split(PARAGRAPH_SEP)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .flat_map(|p| split_long(p, chunk_size))
        .collect();

    let mut texts: Vec<String> = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        let piece_len = char_len(piece);
        if current.is_empty() {
            current.push_str(piece);
            continue;
        }
        if char_len(&current) + PARAGRAPH_SEP.len() + piece_len <= chunk_size {
            current.push_str(PARAGRAPH_SEP);
            current.push_str(piece);
            continue;
        }

        let finished = std::mem::take(&mut current);
        let room = chunk_size.saturating_sub(piece_len + PARAGRAPH_SEP.len());
        let seed = tail(&finished, overlap.min(room)).trim_start();
        if !seed.is_empty() {
            current.push_str(seed);
            current.push_str(PARAGRAPH_SEP);
        }
        current.push_str(piece);
        texts.push(finished);
    }
    if !current.is_empty() {
        texts.push(current);
    }

    texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| Chunk {
            id: format!("{}:{}", unique_id, i),
            unique_id: unique_id.to_string(),
            index: i as i64,
            text,
        })
        .collect()
}
