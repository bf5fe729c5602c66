//! Pipeline stages for document analysis.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. a different extraction backend) without
//! touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ chunk ──▶ infer (map) ──▶ infer (reduce)
//! (pdf text)  (budget)  (per chunk)     (synthesis)
//! ```
//!
//! 1. [`extract`] — pull the PDF text layer page by page and sanitise it;
//!    runs in `spawn_blocking` because PDF parsing is CPU-bound
//! 2. [`chunk`]   — plan contiguous, non-overlapping chunks that fit the
//!    context budget, preserving reading order exactly
//! 3. [`infer`]   — drive the runtime call with timeout/retry/backoff;
//!    the only stage with network I/O
//!
//! The [`crate::job`] coordinator owns sequencing and status transitions.

pub mod chunk;
pub mod extract;
pub mod infer;
