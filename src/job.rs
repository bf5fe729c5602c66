//! Job coordination: admission, the per-document pipeline, and status.
//!
//! The coordinator is the one place where everything meets: it admits a
//! submission past the rate limiter and the setup gate, claims the single
//! concurrency slot, stages the upload, and drives the pipeline task
//! through its status chain:
//!
//! ```text
//! Queued → Extracting → Running → [Synthesizing] → Done
//!                               ↘ Failed (any stage)
//! ```
//!
//! ## One job at a time
//!
//! The runtime is a single shared local resource; running two inference
//! jobs concurrently just makes both slower and can evict the model
//! between calls. The slot is a one-permit semaphore claimed with
//! `try_acquire` — a submission that finds it taken is **rejected with
//! [`AnalysisError::Busy`]**, not queued, so callers always learn the
//! truth immediately.
//!
//! ## Map-reduce over chunks
//!
//! One chunk ⇒ one inference call. Several chunks ⇒ one call per chunk in
//! strict index order (deterministic synthesis input), then a single
//! synthesis pass combining the partial analyses. This bounds worst-case
//! latency linearly in document length while every call fits the context
//! budget.
//!
//! ## Cleanup discipline
//!
//! Success deletes the staged input eagerly and leaves the result under
//! its own expiry. Failure deletes everything the job created. The sweep
//! remains the backstop for crashes; while the pipeline runs, its
//! artifacts are pinned so the sweep cannot pull them out from under it.

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, ErrorKind};
use crate::pipeline::chunk::{plan_chunks, TextChunk};
use crate::pipeline::extract::{document_text, extract_pages};
use crate::pipeline::infer::{infer, FailureTracker};
use crate::prompts;
use crate::ratelimit::RateLimiter;
use crate::runtime::RuntimeClient;
use crate::setup::SetupOrchestrator;
use crate::store::{FileStore, StagedDocument};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle status of an analysis job. Monotonic for one job; a new
/// submission gets a fresh job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Extracting,
    Running,
    Synthesizing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Extracting => "extracting",
            JobStatus::Running => "running",
            JobStatus::Synthesizing => "synthesizing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error recorded on a failed job: stable kind plus human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// One analysis job. Snapshots of this record are what status polls see.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub model: String,
    /// Template snapshot taken at submission; later template edits do not
    /// affect a job already in flight.
    pub prompt: String,
    pub status: JobStatus,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Suggested filename for delivering the result.
    pub download_name: String,
    pub page_count: Option<usize>,
    pub chunk_count: Option<usize>,
    pub inference_calls: u32,
    /// Set only when `status == Done`.
    #[serde(skip)]
    pub result_path: Option<std::path::PathBuf>,
    /// Set only when `status == Failed`.
    pub error: Option<JobError>,
}

/// Admits submissions and drives the per-document pipeline.
pub struct JobCoordinator {
    config: AnalysisConfig,
    store: Arc<FileStore>,
    client: Arc<dyn RuntimeClient>,
    setup: Arc<SetupOrchestrator>,
    limiter: RateLimiter,
    tracker: FailureTracker,
    jobs: Mutex<HashMap<Uuid, AnalysisJob>>,
    slot: Arc<Semaphore>,
}

impl JobCoordinator {
    pub fn new(
        config: AnalysisConfig,
        store: Arc<FileStore>,
        client: Arc<dyn RuntimeClient>,
        setup: Arc<SetupOrchestrator>,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit, config.rate_window);
        Self {
            config,
            store,
            client,
            setup,
            limiter,
            tracker: FailureTracker::new(),
            jobs: Mutex::new(HashMap::new()),
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Submit a document for analysis.
    ///
    /// Admission checks run in a fixed order, all before any byte reaches
    /// storage: rate limit, setup gate, concurrency slot, upload
    /// validation. A rejection at any of them leaves no trace.
    pub fn submit(
        self: &Arc<Self>,
        bytes: &[u8],
        declared_name: &str,
        client_key: &str,
        prompt_template: &str,
    ) -> Result<AnalysisJob, AnalysisError> {
        if !self.limiter.admit(client_key) {
            return Err(AnalysisError::RateLimited);
        }

        let state = self.setup.current_state();
        let model = state
            .ready_model()
            .ok_or_else(|| AnalysisError::RuntimeUnavailable {
                reason: format!("setup incomplete (state: {state:?})"),
            })?
            .to_string();

        let permit = Arc::clone(&self.slot)
            .try_acquire_owned()
            .map_err(|_| AnalysisError::Busy)?;

        let doc = self.store.stage(bytes, declared_name)?;

        let now = SystemTime::now();
        let job = AnalysisJob {
            id: Uuid::new_v4(),
            document_id: doc.id,
            model: model.clone(),
            prompt: prompt_template.to_string(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            download_name: doc.download_name.clone(),
            page_count: None,
            chunk_count: None,
            inference_calls: 0,
            result_path: None,
            error: None,
        };
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job.clone());

        info!(job = %job.id, document = %doc.id, model = %model, "job accepted");

        let this = Arc::clone(self);
        let job_id = job.id;
        tokio::spawn(async move {
            let _permit = permit;
            let _input_pin = this.store.pin(doc.id);
            let _output_pin = this.store.pin(job_id);

            let outcome =
                tokio::time::timeout(this.config.job_timeout, this.run_pipeline(job_id, &doc))
                    .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => this.fail(job_id, &doc, e),
                Err(_elapsed) => this.fail(
                    job_id,
                    &doc,
                    AnalysisError::InferenceTimeout {
                        model: this.job(job_id).map(|j| j.model).unwrap_or_default(),
                        secs: this.config.job_timeout.as_secs(),
                    },
                ),
            }
        });

        Ok(job)
    }

    /// Snapshot of a job record.
    pub fn job(&self, id: Uuid) -> Option<AnalysisJob> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Result artifact bytes for a Done job.
    pub fn fetch_result(&self, id: Uuid) -> Result<Vec<u8>, AnalysisError> {
        let job = self.job(id).ok_or(AnalysisError::JobNotFound)?;
        if job.status != JobStatus::Done {
            return Err(AnalysisError::ResultNotReady {
                status: job.status.to_string(),
            });
        }
        // Pin while reading: a sweep racing this read must not win.
        let _pin = self.store.pin(id);
        self.store.read_result(id)
    }

    /// Current consecutive-inference-failure streak (observability).
    pub fn failure_streak(&self) -> u32 {
        self.tracker.streak()
    }

    // ── Pipeline ─────────────────────────────────────────────────────────

    async fn run_pipeline(
        &self,
        job_id: Uuid,
        doc: &StagedDocument,
    ) -> Result<(), AnalysisError> {
        let (model, template) = {
            let job = self.job(job_id).ok_or(AnalysisError::JobNotFound)?;
            (job.model, job.prompt)
        };

        // ── Extract ──────────────────────────────────────────────────────
        self.update(job_id, |j| j.status = JobStatus::Extracting);
        let pages = extract_pages(&doc.path, self.config.max_pages).await?;
        self.update(job_id, |j| j.page_count = Some(pages.len()));

        let text = document_text(&pages, self.config.max_text_chars);
        let chunks = plan_chunks(doc.id, &text, self.config.context_budget);
        if chunks.is_empty() {
            return Err(AnalysisError::Extraction {
                reason: "document produced no analysable text".into(),
            });
        }
        self.update(job_id, |j| j.chunk_count = Some(chunks.len()));

        // ── Run (map) and synthesize (reduce) ────────────────────────────
        self.update(job_id, |j| j.status = JobStatus::Running);
        let result = if chunks.len() == 1 {
            self.call(&model, &prompts::analysis_prompt(&template, &chunks[0].text), job_id)
                .await?
        } else {
            let partials = self.map_phase(&model, &template, &chunks, job_id).await?;
            self.update(job_id, |j| j.status = JobStatus::Synthesizing);
            self.call(&model, &prompts::synthesis_prompt(&template, &partials), job_id)
                .await?
        };

        // ── Persist and finish ───────────────────────────────────────────
        let result_path = self.store.persist_result(job_id, &result)?;
        self.update(job_id, |j| {
            j.status = JobStatus::Done;
            j.result_path = Some(result_path.clone());
        });

        // Input delivered its value; only the result needs to live on.
        self.store.remove_document(doc);
        info!(job = %job_id, "analysis complete");
        Ok(())
    }

    /// Analyse every chunk independently, in strict index order.
    async fn map_phase(
        &self,
        model: &str,
        template: &str,
        chunks: &[TextChunk],
        job_id: Uuid,
    ) -> Result<Vec<String>, AnalysisError> {
        let total = chunks.len();
        let mut partials = Vec::with_capacity(total);
        for chunk in chunks {
            let prompt = prompts::chunk_prompt(template, chunk.index, total, &chunk.text);
            partials.push(self.call(model, &prompt, job_id).await?);
        }
        Ok(partials)
    }

    async fn call(
        &self,
        model: &str,
        prompt: &str,
        job_id: Uuid,
    ) -> Result<String, AnalysisError> {
        self.update(job_id, |j| j.inference_calls += 1);
        infer(self.client.as_ref(), model, prompt, &self.config, &self.tracker).await
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut AnalysisJob)) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&id) {
            f(job);
            job.updated_at = SystemTime::now();
        }
    }

    fn fail(&self, job_id: Uuid, doc: &StagedDocument, err: AnalysisError) {
        warn!(job = %job_id, "job failed: {err}");
        self.update(job_id, |j| {
            j.status = JobStatus::Failed;
            j.error = Some(JobError {
                kind: err.kind(),
                message: err.to_string(),
            });
        });
        // Eager cleanup: nothing of a failed job waits for the sweep.
        self.store.remove_document(doc);
        self.store.remove_result(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    const PDF_GARBAGE: &[u8] = b"%PDF-1.4 garbage that will not extract";

    async fn coordinator_with(mock: MockRuntime, ready: bool) -> (tempfile::TempDir, Arc<JobCoordinator>) {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalysisConfig::builder()
            .data_dir(dir.path())
            .build()
            .unwrap();
        let client: Arc<dyn RuntimeClient> = Arc::new(mock);
        let store = Arc::new(FileStore::new(&config).unwrap());
        let setup = Arc::new(SetupOrchestrator::new(Arc::clone(&client), &config));
        if ready {
            setup.start("llama3.2").unwrap();
            setup.wait_idle().await;
            assert!(setup.current_state().ready_model().is_some());
        }
        (
            dir,
            Arc::new(JobCoordinator::new(config, store, client, setup)),
        )
    }

    #[tokio::test]
    async fn submit_before_model_ready_is_rejected_without_a_job() {
        let (dir, coord) = coordinator_with(MockRuntime::new(), false).await;

        let err = coord
            .submit(PDF_GARBAGE, "doc.pdf", "client", "Summarize.")
            .unwrap_err();
        assert!(matches!(err, AnalysisError::RuntimeUnavailable { .. }));

        assert!(coord.jobs.lock().unwrap().is_empty());
        let staged = std::fs::read_dir(dir.path().join("uploads")).unwrap().count();
        assert_eq!(staged, 0, "rejection must not stage anything");
    }

    #[tokio::test]
    async fn submit_is_rate_limited_per_client() {
        let (_dir, coord) =
            coordinator_with(MockRuntime::new().with_models(&["llama3.2"]), true).await;

        // The limiter counts attempts, not successes: burn the budget with
        // submissions that fail later in the chain (busy slot).
        let first = coord
            .submit(PDF_GARBAGE, "doc.pdf", "client-a", "Summarize.")
            .unwrap();
        assert_eq!(first.status, JobStatus::Queued);

        let mut rejected = None;
        for _ in 0..10 {
            match coord.submit(PDF_GARBAGE, "doc.pdf", "client-a", "Summarize.") {
                Err(AnalysisError::RateLimited) => {
                    rejected = Some(());
                    break;
                }
                Err(AnalysisError::Busy) => continue,
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(rejected.is_some(), "11th request within the window must be rate-limited");

        // A different client still passes the limiter (and hits the busy slot).
        match coord.submit(PDF_GARBAGE, "doc.pdf", "client-b", "Summarize.") {
            Err(AnalysisError::Busy) | Ok(_) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_submission_while_running_is_busy() {
        let mock = MockRuntime::new().with_models(&["llama3.2"]);
        mock.set_generate_delay(std::time::Duration::from_secs(600));
        let (_dir, coord) = coordinator_with(mock, true).await;

        let first = coord
            .submit(PDF_GARBAGE, "one.pdf", "client", "Summarize.")
            .unwrap();
        assert_eq!(first.status, JobStatus::Queued);

        let err = coord
            .submit(PDF_GARBAGE, "two.pdf", "client", "Summarize.")
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Busy));
    }

    #[tokio::test]
    async fn oversize_upload_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalysisConfig::builder()
            .data_dir(dir.path())
            .max_upload_bytes(16)
            .build()
            .unwrap();
        let client: Arc<dyn RuntimeClient> =
            Arc::new(MockRuntime::new().with_models(&["llama3.2"]));
        let store = Arc::new(FileStore::new(&config).unwrap());
        let setup = Arc::new(SetupOrchestrator::new(Arc::clone(&client), &config));
        setup.start("llama3.2").unwrap();
        setup.wait_idle().await;
        let coord = Arc::new(JobCoordinator::new(config, store, client, setup));

        let big = b"%PDF-1.4 payload well over sixteen bytes";
        let err = coord.submit(big, "big.pdf", "client", "Summarize.").unwrap_err();
        assert!(matches!(err, AnalysisError::Validation { .. }));
        assert!(coord.jobs.lock().unwrap().is_empty());
        assert_eq!(
            std::fs::read_dir(dir.path().join("uploads")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn failed_extraction_marks_job_failed_and_cleans_up() {
        let (dir, coord) =
            coordinator_with(MockRuntime::new().with_models(&["llama3.2"]), true).await;

        let job = coord
            .submit(PDF_GARBAGE, "junk.pdf", "client", "Summarize.")
            .unwrap();

        // The garbage body fails extraction almost immediately.
        let mut status = coord.job(job.id).unwrap().status;
        for _ in 0..200 {
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            status = coord.job(job.id).unwrap().status;
        }

        let record = coord.job(job.id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        let err = record.error.unwrap();
        assert_eq!(err.kind, ErrorKind::Extraction);
        assert!(record.result_path.is_none());

        // Eager cleanup removed the staged input.
        assert_eq!(
            std::fs::read_dir(dir.path().join("uploads")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn fetch_result_before_done_reports_not_ready() {
        let mock = MockRuntime::new().with_models(&["llama3.2"]);
        mock.set_generate_delay(std::time::Duration::from_secs(600));
        let (_dir, coord) = coordinator_with(mock, true).await;

        let job = coord
            .submit(PDF_GARBAGE, "doc.pdf", "client", "Summarize.")
            .unwrap();
        let err = coord.fetch_result(job.id).unwrap_err();
        assert!(matches!(err, AnalysisError::ResultNotReady { .. }));

        assert!(matches!(
            coord.fetch_result(Uuid::new_v4()),
            Err(AnalysisError::JobNotFound)
        ));
    }
}
