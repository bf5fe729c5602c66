//! Staged storage with opaque names, strict permissions, and timed cleanup.
//!
//! ## Why opaque names?
//!
//! The declared filename is attacker-controlled. Nothing derived from it
//! ever reaches the filesystem: staged inputs are stored as
//! `uploads/<uuid>.pdf` and results as `outputs/<uuid>.txt`, which removes
//! the whole path-traversal class instead of filtering it. The sanitised
//! original name survives only as a suggested download name on the
//! document record.
//!
//! ## Cleanup contract
//!
//! Every artifact has a retention window. The normal path deletes eagerly
//! (the coordinator removes a staged input once its job terminates), but
//! the periodic [`FileStore::sweep`] is the backstop that guarantees
//! cleanup even after a crash mid-job — it works off file modification
//! times, the only state that survives a restart. Artifacts a job is
//! actively reading are protected by RAII [`PinGuard`]s, so a job running
//! past its artifact's nominal expiry never has the file deleted
//! mid-read.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use uuid::Uuid;
use tracing::{debug, info, warn};

/// A staged upload, owned by the [`FileStore`] until its job completes.
#[derive(Debug, Clone)]
pub struct StagedDocument {
    /// Opaque identifier; also the storage file stem.
    pub id: Uuid,
    /// Sanitised original name, used only to derive the result's
    /// suggested download name.
    pub download_name: String,
    /// Storage path. Never exposed outside the pipeline.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

/// Staged storage for uploads and result artifacts.
pub struct FileStore {
    uploads_dir: PathBuf,
    outputs_dir: PathBuf,
    retention: Duration,
    max_upload_bytes: u64,
    pinned: Arc<Mutex<HashSet<Uuid>>>,
}

impl FileStore {
    /// Create the store, its directories (owner-only on unix), and sweep
    /// away anything a previous process left behind past retention.
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let uploads_dir = config.data_dir.join("uploads");
        let outputs_dir = config.data_dir.join("outputs");
        for dir in [&uploads_dir, &outputs_dir] {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        let store = Self {
            uploads_dir,
            outputs_dir,
            retention: config.retention,
            max_upload_bytes: config.max_upload_bytes,
            pinned: Arc::new(Mutex::new(HashSet::new())),
        };

        let stale = store.sweep();
        if stale > 0 {
            info!(count = stale, "removed stale artifacts from previous run");
        }
        Ok(store)
    }

    // ── Staging ──────────────────────────────────────────────────────────

    /// Validate and persist an upload.
    ///
    /// Size, extension, and the `%PDF` signature are all checked before a
    /// single byte is written, so a rejected request leaves no artifact.
    pub fn stage(&self, bytes: &[u8], declared_name: &str) -> Result<StagedDocument, AnalysisError> {
        if bytes.len() as u64 > self.max_upload_bytes {
            return Err(AnalysisError::Validation {
                reason: format!(
                    "file too large ({} bytes, max {})",
                    bytes.len(),
                    self.max_upload_bytes
                ),
            });
        }
        if bytes.is_empty() {
            return Err(AnalysisError::Validation {
                reason: "empty upload".into(),
            });
        }

        let clean_name = sanitize_declared_name(declared_name)?;

        if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
            return Err(AnalysisError::Validation {
                reason: "not a PDF file (missing %PDF signature)".into(),
            });
        }

        let id = Uuid::new_v4();
        let path = self.uploads_dir.join(format!("{id}.pdf"));
        write_owner_only(&path, bytes)?;

        let now = SystemTime::now();
        let stem = clean_name.strip_suffix(".pdf").unwrap_or(&clean_name);
        let doc = StagedDocument {
            id,
            download_name: format!("{stem}_analysis.txt"),
            path,
            size_bytes: bytes.len() as u64,
            created_at: now,
            expires_at: now + self.retention,
        };
        debug!(document = %doc.id, bytes = doc.size_bytes, "staged upload");
        Ok(doc)
    }

    // ── Results ──────────────────────────────────────────────────────────

    /// Persist a result artifact with its own expiry.
    ///
    /// Atomic write (temp file + rename) so a crash never leaves a
    /// half-written result that a status poll would report as Done.
    pub fn persist_result(&self, job_id: Uuid, text: &str) -> Result<PathBuf, AnalysisError> {
        let path = self.outputs_dir.join(format!("{job_id}.txt"));
        let tmp = self.outputs_dir.join(format!("{job_id}.txt.tmp"));
        write_owner_only(&tmp, text.as_bytes())?;
        std::fs::rename(&tmp, &path)?;
        debug!(job = %job_id, bytes = text.len(), "result persisted");
        Ok(path)
    }

    /// Read a result artifact back for delivery.
    pub fn read_result(&self, job_id: Uuid) -> Result<Vec<u8>, AnalysisError> {
        let path = self.outputs_dir.join(format!("{job_id}.txt"));
        std::fs::read(&path).map_err(|_| AnalysisError::JobNotFound)
    }

    // ── Eager removal ────────────────────────────────────────────────────

    /// Remove a staged input (normal-completion path or failure cleanup).
    pub fn remove_document(&self, doc: &StagedDocument) {
        remove_quiet(&doc.path);
    }

    /// Remove a job's result artifact, if any.
    pub fn remove_result(&self, job_id: Uuid) {
        remove_quiet(&self.outputs_dir.join(format!("{job_id}.txt")));
    }

    // ── Pinning ──────────────────────────────────────────────────────────

    /// Protect an artifact from the sweep while a job reads it.
    ///
    /// The guard releases on drop; holding it binds the artifact's
    /// lifetime to the job rather than to wall-clock expiry.
    pub fn pin(&self, id: Uuid) -> PinGuard {
        self.pinned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        PinGuard {
            id,
            pinned: Arc::clone(&self.pinned),
        }
    }

    fn is_pinned(&self, id: Uuid) -> bool {
        self.pinned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    // ── Sweep ────────────────────────────────────────────────────────────

    /// Delete every unpinned artifact whose retention has lapsed.
    /// Returns the number of files removed.
    pub fn sweep(&self) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        for dir in [&self.uploads_dir, &self.outputs_dir] {
            removed += self.sweep_dir(dir, now);
        }
        if removed > 0 {
            info!(count = removed, "sweep removed expired artifacts");
        }
        removed
    }

    fn sweep_dir(&self, dir: &Path, now: SystemTime) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %dir.display(), "sweep cannot read directory: {e}");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            // Artifact file stems start with the owning document/job uuid.
            if let Some(id) = uuid_from_path(&path) {
                if self.is_pinned(id) {
                    continue;
                }
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| now.duration_since(mtime).unwrap_or_default() >= self.retention)
                .unwrap_or(false);
            if expired && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Spawn the periodic sweep task. The handle is detached by callers
    /// that want the backstop for the process lifetime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it, new() already swept.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}

/// RAII token keeping an artifact out of the sweep's reach.
pub struct PinGuard {
    id: Uuid,
    pinned: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pinned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Reduce a declared filename to a safe basename and require a `.pdf`
/// extension.
fn sanitize_declared_name(declared: &str) -> Result<String, AnalysisError> {
    let base = declared
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base.len() > 255 || base.contains("..") || base.contains('\0') {
        return Err(AnalysisError::Validation {
            reason: "invalid filename".into(),
        });
    }
    if !base.to_ascii_lowercase().ends_with(".pdf") {
        return Err(AnalysisError::Validation {
            reason: "only PDF files are accepted".into(),
        });
    }
    Ok(base.to_string())
}

fn write_owner_only(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn remove_quiet(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "artifact removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove artifact: {e}"),
    }
}

fn uuid_from_path(path: &Path) -> Option<Uuid> {
    let stem = path.file_stem()?.to_str()?;
    // Result temp files are "<uuid>.txt.tmp"; take the leading uuid chars.
    Uuid::parse_str(stem.get(..36)?).ok()
}
