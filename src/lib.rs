//! # paperlens
//!
//! Analyze PDF documents with a locally hosted LLM runtime — nothing
//! leaves the host.
//!
//! ## Why this crate?
//!
//! Sending contracts, medical letters, or financial statements to a cloud
//! API is a non-starter for many users. paperlens drives a local
//! Ollama-compatible runtime instead: it bootstraps the runtime, pulls the
//! selected model, extracts and chunks the document text to fit the
//! model's context budget, and runs the analysis with retry/timeout
//! discipline — all behind one service facade a thin HTTP layer can sit on.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Admit    rate limit → setup gate → single-job slot
//!  ├─ 2. Stage    validate size/type, opaque name, owner-only perms
//!  ├─ 3. Extract  PDF text layer per page (CPU-bound, spawn_blocking)
//!  ├─ 4. Chunk    context-budget-sized, order-preserving, lossless
//!  ├─ 5. Infer    one call per chunk (map), then one synthesis pass
//!  └─ 6. Deliver  result artifact with its own expiry; timed sweep
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paperlens::{AnalysisConfig, AnalysisService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = AnalysisService::new(AnalysisConfig::default())?;
//!     service.start_setup()?;
//!     // poll service.setup_status() until ModelReady, then:
//!     let bytes = std::fs::read("report.pdf")?;
//!     let job = service.submit(&bytes, "report.pdf", "local")?;
//!     // poll service.job(job.id) until Done, then:
//!     let (result, name) = service.fetch_result(job.id)?;
//!     std::fs::write(&name, result)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `paperlens` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! paperlens = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod prompts;
pub mod ratelimit;
pub mod runtime;
pub mod service;
pub mod setup;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{AnalysisConfig, AnalysisConfigBuilder, Settings, RUNTIME_URL_ENV};
pub use error::{AnalysisError, ErrorKind};
pub use job::{AnalysisJob, JobCoordinator, JobStatus};
pub use pipeline::chunk::TextChunk;
pub use runtime::{ModelInfo, MockRuntime, OllamaClient, RuntimeClient};
pub use service::AnalysisService;
pub use setup::{SetupOrchestrator, SetupState};
pub use store::{FileStore, StagedDocument};
