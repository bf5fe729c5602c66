//! Error types for the paperlens library.
//!
//! One taxonomy serves two audiences:
//!
//! * [`AnalysisError`] — the `Result` error of every public operation.
//!   Variants carry enough context to render a useful message, and a
//!   hint line where the caller can act on it.
//!
//! * [`ErrorKind`] — a stable, serialisable discriminant recorded on a
//!   failed [`crate::job::AnalysisJob`] so status polls can branch on the
//!   failure class without parsing message strings.
//!
//! Rejections (`Validation`, `RateLimited`, `Busy`, `RuntimeUnavailable`)
//! are detected before any artifact is created; pipeline failures
//! (`Extraction`, `Inference*`) abort the job and trigger eager cleanup.
//! Messages never expose storage paths or internal state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors returned by the paperlens library.
#[derive(Debug, Error)]
pub enum AnalysisError {
    // ── Admission errors ──────────────────────────────────────────────────
    /// The upload failed validation before any byte was persisted.
    #[error("Invalid document: {reason}")]
    Validation { reason: String },

    /// The client exceeded the sliding-window request budget.
    #[error("Rate limit exceeded. Try again later.")]
    RateLimited,

    /// Another analysis job is already running.
    ///
    /// The runtime is a single shared local resource; submissions while a
    /// job is in flight are rejected rather than queued. Poll the running
    /// job and resubmit once it reaches a terminal status.
    #[error("An analysis is already running. Retry when it completes.")]
    Busy,

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The document is encrypted, scanned (no text layer), or corrupt.
    #[error("Text extraction failed: {reason}")]
    Extraction { reason: String },

    /// Setup is incomplete or the runtime stopped answering.
    #[error("Local LLM runtime unavailable: {reason}\nRun setup, or check that the runtime is listening.")]
    RuntimeUnavailable { reason: String },

    /// An inference call exceeded its hard timeout on every retry.
    #[error("Inference timed out after {secs}s (model '{model}')")]
    InferenceTimeout { model: String, secs: u64 },

    /// The runtime returned a failure the client will not retry.
    #[error("Inference failed: {reason}")]
    Inference { reason: String },

    // ── Setup errors ──────────────────────────────────────────────────────
    /// A bootstrap step exceeded its maximum wait.
    #[error("Setup step '{step}' timed out after {secs}s")]
    SetupTimeout { step: &'static str, secs: u64 },

    /// The requested model is not on the allow-list.
    #[error("Model '{model}' is not an allowed model name")]
    ModelNotAllowed { model: String },

    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No job with the given id exists.
    #[error("Unknown job id")]
    JobNotFound,

    /// The job exists but has not produced a result yet.
    #[error("Result not ready: job status is {status}")]
    ResultNotReady { status: String },

    // ── I/O / internal ────────────────────────────────────────────────────
    /// Storage operation failed.
    #[error("Storage error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Stable discriminant for job records and API payloads.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Validation { .. } => ErrorKind::Validation,
            AnalysisError::RateLimited => ErrorKind::RateLimited,
            AnalysisError::Busy => ErrorKind::Busy,
            AnalysisError::Extraction { .. } => ErrorKind::Extraction,
            AnalysisError::RuntimeUnavailable { .. } => ErrorKind::RuntimeUnavailable,
            AnalysisError::InferenceTimeout { .. } => ErrorKind::InferenceTimeout,
            AnalysisError::Inference { .. } => ErrorKind::Inference,
            AnalysisError::SetupTimeout { .. } => ErrorKind::SetupTimeout,
            AnalysisError::ModelNotAllowed { .. } => ErrorKind::Validation,
            AnalysisError::JobNotFound => ErrorKind::NotFound,
            AnalysisError::ResultNotReady { .. } => ErrorKind::NotFound,
            AnalysisError::Io { .. } | AnalysisError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Serialisable failure class stored on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RateLimited,
    Busy,
    Extraction,
    RuntimeUnavailable,
    InferenceTimeout,
    Inference,
    SetupTimeout,
    NotFound,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Busy => "busy",
            ErrorKind::Extraction => "extraction",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::InferenceTimeout => "inference_timeout",
            ErrorKind::Inference => "inference",
            ErrorKind::SetupTimeout => "setup_timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_carries_reason() {
        let e = AnalysisError::Validation {
            reason: "file exceeds 50 MB".into(),
        };
        assert!(e.to_string().contains("50 MB"));
        assert_eq!(e.kind(), ErrorKind::Validation);
    }

    #[test]
    fn inference_timeout_display() {
        let e = AnalysisError::InferenceTimeout {
            model: "llama3.2".into(),
            secs: 300,
        };
        let msg = e.to_string();
        assert!(msg.contains("300s"));
        assert!(msg.contains("llama3.2"));
        assert_eq!(e.kind(), ErrorKind::InferenceTimeout);
    }

    #[test]
    fn model_not_allowed_maps_to_validation_kind() {
        let e = AnalysisError::ModelNotAllowed {
            model: "evil/model".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Validation);
    }

    #[test]
    fn kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RuntimeUnavailable).unwrap();
        assert_eq!(json, "\"runtime_unavailable\"");
        let json = serde_json::to_string(&ErrorKind::InferenceTimeout).unwrap();
        assert_eq!(json, "\"inference_timeout\"");
    }

    #[test]
    fn kind_display_matches_serde() {
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate_limited");
        assert_eq!(ErrorKind::Busy.to_string(), "busy");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let e: AnalysisError = io.into();
        assert_eq!(e.kind(), ErrorKind::Internal);
    }
}
