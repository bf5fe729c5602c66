//! Prompt templates for document analysis.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing how documents are analysed or
//!    how partial analyses are combined requires editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect the assembled prompts
//!    directly without a live runtime, making prompt regressions easy to
//!    catch.
//!
//! The user-editable template (the "what to do with this document"
//! instruction) lives in [`PromptStore`], persisted to disk so it survives
//! restarts. The map/reduce framing around it is fixed.

use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Default analysis instruction used until the caller stores its own.
pub const DEFAULT_PROMPT: &str =
    "Analyze this document and provide a clear, structured summary of its \
     key points, findings, and any action items.";

/// Maximum stored template length in characters.
///
/// Anything longer would crowd the document text out of the context
/// budget.
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// Assemble the prompt for a single-chunk (or map-phase) inference call.
pub fn analysis_prompt(template: &str, chunk_text: &str) -> String {
    format!("{template}\n\nDocument content:\n{chunk_text}")
}

/// Assemble the map-phase prompt for one chunk of a multi-chunk document.
///
/// The part marker keeps the model from treating a fragment as the whole
/// document (and, say, complaining about an abrupt ending).
pub fn chunk_prompt(template: &str, index: usize, total: usize, chunk_text: &str) -> String {
    format!(
        "{template}\n\nThis is part {part} of {total} of the document. \
         Analyze this part on its own; a final pass will combine all parts.\n\n\
         Document content (part {part} of {total}):\n{chunk_text}",
        part = index + 1,
    )
}

/// Assemble the synthesis (reduce) prompt from the per-chunk analyses,
/// in chunk order.
pub fn synthesis_prompt(template: &str, partials: &[String]) -> String {
    let mut body = String::new();
    for (i, partial) in partials.iter().enumerate() {
        body.push_str(&format!("--- Analysis of part {} ---\n{}\n\n", i + 1, partial));
    }
    format!(
        "The following are partial analyses of consecutive parts of one \
         document, in reading order. Combine them into a single coherent \
         analysis that satisfies this instruction:\n\n{template}\n\n{body}"
    )
}

// ── PromptStore ──────────────────────────────────────────────────────────

/// Persisted, user-editable analysis template.
///
/// Stored at `<data_dir>/prompt.txt` with owner-only permissions. Reads
/// fall back to [`DEFAULT_PROMPT`] when no template has been stored; writes
/// are length-capped and stripped of control characters.
pub struct PromptStore {
    path: PathBuf,
    // Cached so get() on the submit path never touches disk.
    cached: Mutex<Option<String>>,
}

impl PromptStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("prompt.txt"),
            cached: Mutex::new(None),
        }
    }

    /// Current template, or the default when none is stored.
    pub fn get(&self) -> String {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ref t) = *cached {
            return t.clone();
        }
        let template = match std::fs::read_to_string(&self.path) {
            Ok(raw) => sanitize_template(&raw),
            Err(e) => {
                debug!("no stored prompt ({e}), using default");
                DEFAULT_PROMPT.to_string()
            }
        };
        *cached = Some(template.clone());
        template
    }

    /// Store a new template for subsequent submissions.
    pub fn set(&self, template: &str) -> std::io::Result<()> {
        let template = sanitize_template(template);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &template)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            {
                warn!("could not restrict prompt file permissions: {e}");
            }
        }
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(template);
        Ok(())
    }
}

/// Cap length and strip control characters (tab and newline survive).
fn sanitize_template(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .take(MAX_PROMPT_CHARS)
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        DEFAULT_PROMPT.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_prompt_embeds_both_parts() {
        let p = analysis_prompt("Summarize.", "Hello world.");
        assert!(p.starts_with("Summarize."));
        assert!(p.contains("Hello world."));
    }

    #[test]
    fn chunk_prompt_numbers_parts_from_one() {
        let p = chunk_prompt("Summarize.", 0, 3, "text");
        assert!(p.contains("part 1 of 3"));
        let p = chunk_prompt("Summarize.", 2, 3, "text");
        assert!(p.contains("part 3 of 3"));
    }

    #[test]
    fn synthesis_prompt_preserves_chunk_order() {
        let partials = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let p = synthesis_prompt("Summarize.", &partials);
        let a = p.find("alpha").unwrap();
        let b = p.find("beta").unwrap();
        let c = p.find("gamma").unwrap();
        assert!(a < b && b < c);
        assert!(p.contains("part 1"));
        assert!(p.contains("part 3"));
    }

    #[test]
    fn store_returns_default_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path());
        assert_eq!(store.get(), DEFAULT_PROMPT);
    }

    #[test]
    fn store_set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path());
        store.set("Extract every date mentioned.").unwrap();
        assert_eq!(store.get(), "Extract every date mentioned.");

        // A fresh store re-reads from disk.
        let store2 = PromptStore::new(dir.path());
        assert_eq!(store2.get(), "Extract every date mentioned.");
    }

    #[test]
    fn store_strips_control_characters() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path());
        store.set("Summarize\x00 this\x07 document.\nThanks.").unwrap();
        let got = store.get();
        assert!(!got.contains('\x00'));
        assert!(!got.contains('\x07'));
        assert!(got.contains("\nThanks."));
    }

    #[test]
    fn store_caps_template_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path());
        let long = "x".repeat(MAX_PROMPT_CHARS + 500);
        store.set(&long).unwrap();
        assert_eq!(store.get().chars().count(), MAX_PROMPT_CHARS);
    }

    #[test]
    fn blank_template_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path());
        store.set("   \n\t  ").unwrap();
        assert_eq!(store.get(), DEFAULT_PROMPT);
    }
}
