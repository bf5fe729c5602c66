//! PDF text extraction and sanitisation.
//!
//! ## Why spawn_blocking?
//!
//! `pdf-extract` parses the whole document synchronously — content
//! streams, font tables, layout reconstruction. On a 100-page report that
//! is hundreds of milliseconds of pure CPU, which would stall the runtime
//! worker answering status polls. `tokio::task::spawn_blocking` moves it
//! onto the blocking pool, the same discipline the rest of the crate uses
//! for CPU-bound work.
//!
//! ## Sanitisation contract
//!
//! Extracted text is hostile input headed for a prompt: it may carry
//! control characters, mixed line endings, and kilometre-long blank runs.
//! [`sanitize`] normalises all of that. The concatenation of sanitised
//! pages (via [`document_text`]) is the *canonical document text*; the
//! chunk planner round-trips against it exactly.

use crate::error::AnalysisError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::{debug, info, warn};

/// Extract the text layer of every page, sanitised, in reading order.
///
/// Fails with [`AnalysisError::Extraction`] when the document is
/// encrypted, corrupt, or has no extractable text layer at all
/// (image-only scans). Pages beyond `max_pages` are skipped.
pub async fn extract_pages(
    path: &Path,
    max_pages: usize,
) -> Result<Vec<String>, AnalysisError> {
    let path = path.to_path_buf();
    let task = tokio::task::spawn_blocking(move || extract_pages_blocking(&path, max_pages));
    let pages = match task.await {
        Ok(result) => result?,
        // A parser panic on hostile input is an extraction failure of
        // that document, not a crate bug worth crashing the job table for.
        Err(e) if e.is_panic() => {
            return Err(AnalysisError::Extraction {
                reason: "document parser crashed on this file".into(),
            })
        }
        Err(e) => return Err(AnalysisError::Internal(format!("extraction task failed: {e}"))),
    };

    if pages.iter().all(|p| p.trim().is_empty()) {
        return Err(AnalysisError::Extraction {
            reason: "document has no extractable text layer (scanned or image-only)".into(),
        });
    }
    Ok(pages)
}

fn extract_pages_blocking(path: &Path, max_pages: usize) -> Result<Vec<String>, AnalysisError> {
    let bytes = std::fs::read(path).map_err(|e| AnalysisError::Extraction {
        reason: format!("staged document unreadable: {e}"),
    })?;

    let raw_pages = pdf_extract::extract_text_from_mem_by_pages(&bytes).map_err(|e| {
        let detail = e.to_string();
        let reason = if detail.to_ascii_lowercase().contains("encrypt") {
            "document is encrypted".to_string()
        } else {
            format!("document could not be parsed: {detail}")
        };
        AnalysisError::Extraction { reason }
    })?;

    let total = raw_pages.len();
    if total > max_pages {
        info!(total, max_pages, "page cap applied");
    }

    let pages: Vec<String> = raw_pages
        .into_iter()
        .take(max_pages)
        .map(|p| sanitize(&p))
        .collect();

    debug!(pages = pages.len(), "extracted text layer");
    Ok(pages)
}

/// Join sanitised pages into the canonical document text, truncated at
/// `max_chars` (on a char boundary).
pub fn document_text(pages: &[String], max_chars: usize) -> String {
    let joined = pages
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n");

    if joined.chars().count() <= max_chars {
        return joined;
    }
    warn!(max_chars, "document text truncated at cap");
    joined.chars().take(max_chars).collect()
}

// ── Sanitisation ─────────────────────────────────────────────────────────

static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Normalise raw extracted text.
///
/// Rules, in order:
/// 1. CRLF / lone CR → LF
/// 2. Control characters stripped (tab and newline survive)
/// 3. Trailing whitespace trimmed per line
/// 4. Runs of 3+ newlines collapsed to a paragraph break
/// 5. Leading/trailing whitespace trimmed
pub fn sanitize(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let stripped: String = unified
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let trimmed = stripped
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    RE_BLANK_RUNS
        .replace_all(&trimmed, "\n\n")
        .trim()
        .to_string()
}
