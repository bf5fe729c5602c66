//! Configuration for the analysis pipeline.
//!
//! All tunable behaviour lives in [`AnalysisConfig`], built via its
//! [`AnalysisConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share the config across tasks, serialise it for logging, and
//! diff two runs to understand why their outcomes differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest.
//!
//! The small [`Settings`] record at the bottom is different in kind: it is
//! the *persisted* state (selected model, runtime endpoint) that survives
//! process restarts, stored as JSON next to the artifact directories.

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the persisted runtime endpoint.
pub const RUNTIME_URL_ENV: &str = "PAPERLENS_RUNTIME_URL";

/// Configuration for the document analysis pipeline.
///
/// Built via [`AnalysisConfig::builder()`] or [`AnalysisConfig::default()`].
///
/// # Example
/// ```rust
/// use paperlens::AnalysisConfig;
///
/// let config = AnalysisConfig::builder()
///     .context_budget(8_000)
///     .rate_limit(20, std::time::Duration::from_secs(60))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Maximum upload size in bytes. Default: 50 MB.
    ///
    /// Checked against the byte slice length before anything touches disk,
    /// so an oversized upload never creates an artifact.
    pub max_upload_bytes: u64,

    /// Maximum number of pages extracted from a document. Default: 100.
    ///
    /// Pages beyond the cap are ignored rather than failing the job; a
    /// 600-page manual still produces an analysis of its first hundred
    /// pages instead of an error.
    pub max_pages: usize,

    /// Maximum extracted text length in characters. Default: 500 000.
    ///
    /// A cap on pathological documents (machine-generated tables, embedded
    /// data dumps). Extraction truncates at the cap and logs the loss.
    pub max_text_chars: usize,

    /// Context budget per inference call, in characters. Default: 12 000.
    ///
    /// The chunk planner guarantees no chunk exceeds this. Roughly a
    /// 4-chars-per-token proxy: 12 000 chars ≈ 3 000 tokens, leaving room
    /// for the prompt template and the completion inside a 4k-token
    /// context window (the smallest window among the allowed models).
    pub context_budget: usize,

    /// Requests admitted per client key within one rate window. Default: 10.
    pub rate_limit: u32,

    /// Sliding rate-limit window duration. Default: 60 s.
    pub rate_window: Duration,

    /// Retention for staged inputs and result artifacts. Default: 1 h.
    ///
    /// The sweep deletes anything older, whatever happened to its job.
    pub retention: Duration,

    /// Interval between cleanup sweeps. Default: 5 min.
    pub sweep_interval: Duration,

    /// Hard timeout for a single inference call. Default: 300 s.
    ///
    /// Local models on CPU can legitimately take minutes on a full-budget
    /// chunk. Anything past five minutes means a wedged runtime, not a
    /// slow one.
    pub infer_timeout: Duration,

    /// Maximum retry attempts on a transient inference failure. Default: 2.
    ///
    /// Connection-refused and 5xx responses are usually the runtime
    /// restarting or briefly overloaded. Permanent errors (unknown model,
    /// malformed request) are never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s.
    pub retry_backoff_ms: u64,

    /// Consecutive inference failures before the client reports the runtime
    /// unavailable instead of retrying further jobs. Default: 3.
    pub failure_threshold: u32,

    /// Maximum wait for the runtime-install step. Default: 5 min.
    pub install_timeout: Duration,

    /// Maximum wait for a model pull. Default: 30 min.
    pub pull_timeout: Duration,

    /// Overall wall-clock budget for one job. Default: 45 min.
    ///
    /// A job past this is forced to Failed with a timeout kind so the
    /// single concurrency slot is always released.
    pub job_timeout: Duration,

    /// Root directory for staged inputs, results, and persisted settings.
    /// Default: `./paperlens-data`.
    pub data_dir: PathBuf,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 50 * 1024 * 1024,
            max_pages: 100,
            max_text_chars: 500_000,
            context_budget: 12_000,
            rate_limit: 10,
            rate_window: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            infer_timeout: Duration::from_secs(300),
            max_retries: 2,
            retry_backoff_ms: 500,
            failure_threshold: 3,
            install_timeout: Duration::from_secs(300),
            pull_timeout: Duration::from_secs(1800),
            job_timeout: Duration::from_secs(2700),
            data_dir: PathBuf::from("paperlens-data"),
        }
    }
}

impl AnalysisConfig {
    /// Create a new builder for `AnalysisConfig`.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`AnalysisConfig`].
#[derive(Debug)]
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl AnalysisConfigBuilder {
    pub fn max_upload_bytes(mut self, n: u64) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n.max(1);
        self
    }

    pub fn max_text_chars(mut self, n: usize) -> Self {
        self.config.max_text_chars = n;
        self
    }

    pub fn context_budget(mut self, chars: usize) -> Self {
        self.config.context_budget = chars;
        self
    }

    pub fn rate_limit(mut self, cap: u32, window: Duration) -> Self {
        self.config.rate_limit = cap;
        self.config.rate_window = window;
        self
    }

    pub fn retention(mut self, d: Duration) -> Self {
        self.config.retention = d;
        self
    }

    pub fn sweep_interval(mut self, d: Duration) -> Self {
        self.config.sweep_interval = d;
        self
    }

    pub fn infer_timeout(mut self, d: Duration) -> Self {
        self.config.infer_timeout = d;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.config.failure_threshold = n.max(1);
        self
    }

    pub fn install_timeout(mut self, d: Duration) -> Self {
        self.config.install_timeout = d;
        self
    }

    pub fn pull_timeout(mut self, d: Duration) -> Self {
        self.config.pull_timeout = d;
        self
    }

    pub fn job_timeout(mut self, d: Duration) -> Self {
        self.config.job_timeout = d;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalysisConfig, AnalysisError> {
        let c = &self.config;
        if c.context_budget < 256 {
            return Err(AnalysisError::Validation {
                reason: format!("context budget must be ≥ 256 chars, got {}", c.context_budget),
            });
        }
        if c.rate_limit == 0 {
            return Err(AnalysisError::Validation {
                reason: "rate limit cap must be ≥ 1".into(),
            });
        }
        if c.rate_window.is_zero() {
            return Err(AnalysisError::Validation {
                reason: "rate window must be non-zero".into(),
            });
        }
        Ok(self.config)
    }
}

// ── Persisted settings ───────────────────────────────────────────────────

/// The small configuration record that survives process restarts:
/// selected model and runtime endpoint.
///
/// Stored as JSON at `<data_dir>/settings.json` with owner-only
/// permissions. The [`RUNTIME_URL_ENV`] environment variable overrides the
/// persisted endpoint without rewriting the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Selected model name (validated against the allow-list on use).
    pub model: String,
    /// Base URL of the local runtime's HTTP API.
    pub runtime_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            runtime_url: "http://127.0.0.1:11434".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `<data_dir>/settings.json`, falling back to
    /// defaults when the file is missing or unreadable, then applying the
    /// environment override.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("settings.json");
        let mut settings = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<Settings>(&s).ok())
            .unwrap_or_else(|| {
                tracing::debug!(path = %path.display(), "no persisted settings, using defaults");
                Settings::default()
            });

        if let Ok(url) = std::env::var(RUNTIME_URL_ENV) {
            if !url.is_empty() {
                settings.runtime_url = url;
            }
        }
        settings
    }

    /// Persist settings to `<data_dir>/settings.json` (atomic write,
    /// owner-only permissions on unix).
    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("settings.json");
        let tmp = data_dir.join("settings.json.tmp");
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
