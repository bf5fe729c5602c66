//! Chunk planning: fit the document text into the model's context budget.
//!
//! ## The round-trip property
//!
//! Every source character belongs to exactly one chunk, and chunks carry
//! their separators, so concatenating `chunks[0].text ‖ chunks[1].text ‖ …`
//! reproduces the input string byte for byte. That property is what makes
//! the map phase trustworthy: nothing is silently dropped or duplicated
//! between extraction and inference, and tests can assert it mechanically.
//!
//! ## Split preference
//!
//! Paragraph boundaries first, then line boundaries, then sentence
//! boundaries — never mid-word at any of those levels. Only a single
//! unbroken run longer than the whole budget is hard-split, and even then
//! the cut backs up to the last whitespace inside the window when one
//! exists.

use serde::Serialize;
use uuid::Uuid;

/// A contiguous, non-overlapping slice of the document text.
///
/// Immutable once planned; `index` is 0-based and contiguous in reading
/// order.
#[derive(Debug, Clone, Serialize)]
pub struct TextChunk {
    pub document_id: Uuid,
    pub index: usize,
    pub text: String,
    /// Size in characters (the unit of the context budget).
    pub size: usize,
}

/// Plan chunks of at most `budget` characters each.
///
/// An empty input produces no chunks. `budget` must be ≥ 1 (enforced by
/// [`crate::config::AnalysisConfig`]'s builder well above that).
pub fn plan_chunks(document_id: Uuid, text: &str, budget: usize) -> Vec<TextChunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let mut flush = |current: &mut String, current_len: &mut usize, chunks: &mut Vec<TextChunk>| {
        if !current.is_empty() {
            chunks.push(TextChunk {
                document_id,
                index: chunks.len(),
                text: std::mem::take(current),
                size: *current_len,
            });
            *current_len = 0;
        }
    };

    for atom in split_atoms(text, budget) {
        let atom_len = atom.chars().count();
        if current_len + atom_len > budget {
            flush(&mut current, &mut current_len, &mut chunks);
        }
        current.push_str(atom);
        current_len += atom_len;
    }
    flush(&mut current, &mut current_len, &mut chunks);

    chunks
}

// ── Splitting ────────────────────────────────────────────────────────────

/// Break the text into atoms no longer than `budget` characters, keeping
/// every separator attached so concatenation is lossless.
fn split_atoms(text: &str, budget: usize) -> Vec<&str> {
    let mut atoms = Vec::new();
    // Sanitised text uses exactly "\n\n" as its paragraph separator.
    for para in text.split_inclusive("\n\n") {
        if chars(para) <= budget {
            atoms.push(para);
            continue;
        }
        for line in para.split_inclusive('\n') {
            if chars(line) <= budget {
                atoms.push(line);
                continue;
            }
            for sentence in split_sentences(line) {
                if chars(sentence) <= budget {
                    atoms.push(sentence);
                } else {
                    hard_split(sentence, budget, &mut atoms);
                }
            }
        }
    }
    atoms
}

/// Split after sentence-ending punctuation followed by a space; the space
/// stays with the preceding sentence.
fn split_sentences(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev_end = false;
    for (i, c) in line.char_indices() {
        if prev_end && c == ' ' {
            let end = i + c.len_utf8();
            out.push(&line[start..end]);
            start = end;
        }
        prev_end = matches!(c, '.' | '!' | '?');
    }
    if start < line.len() {
        out.push(&line[start..]);
    }
    out
}

/// Cut an oversized run into budget-sized pieces, preferring the last
/// whitespace inside each window.
fn hard_split<'a>(run: &'a str, budget: usize, atoms: &mut Vec<&'a str>) {
    let mut rest = run;
    while chars(rest) > budget {
        let window_end = byte_index_of_char(rest, budget);
        // Keep the whitespace with the left piece; the offset arithmetic
        // must respect multibyte whitespace (U+00A0 and friends).
        let cut = match rest[..window_end].rfind(char::is_whitespace) {
            Some(i) => i + rest[i..].chars().next().map(char::len_utf8).unwrap_or(1),
            None => window_end,
        };
        atoms.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        atoms.push(rest);
    }
}

fn chars(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`-th char boundary (saturating at the end).
fn byte_index_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}
