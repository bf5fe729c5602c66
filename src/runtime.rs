//! Local LLM runtime access: the [`RuntimeClient`] seam and its
//! Ollama-compatible implementation.
//!
//! The trait is the crate's only network boundary. Everything above it —
//! the setup orchestrator, the inference wrapper, the job coordinator —
//! is written against `dyn RuntimeClient`, so tests drive the whole
//! pipeline with [`MockRuntime`] and never open a socket.
//!
//! Error classification lives here too: [`RuntimeError::is_transient`]
//! decides what the retry loop in [`crate::pipeline::infer`] may retry
//! (connection refused, timeouts, 5xx) and what must fail immediately
//! (unknown model, malformed request).

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Models that may be selected or pulled.
///
/// The runtime will happily pull anything from its registry; the
/// allow-list keeps a compromised or confused caller from fetching
/// arbitrary multi-gigabyte images onto the host.
pub const ALLOWED_MODELS: &[&str] = &[
    "llama2",
    "llama3",
    "llama3.2",
    "mistral",
    "phi",
    "phi3",
    "codellama",
    "gemma",
];

/// Check a model name against [`ALLOWED_MODELS`].
///
/// A name is allowed when it equals an entry or is an entry plus a tag
/// suffix (`llama3.2:3b`). Names are matched case-insensitively and
/// capped at 50 characters.
pub fn is_allowed_model(name: &str) -> bool {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() || name.len() > 50 {
        return false;
    }
    ALLOWED_MODELS
        .iter()
        .any(|allowed| name == *allowed || name.starts_with(&format!("{allowed}:")))
}

/// One entry of the runtime's model registry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    /// Approximate on-disk size as reported by the runtime.
    pub size_bytes: Option<u64>,
    pub installed: bool,
}

/// Errors from the runtime boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// TCP-level failure: nothing is listening at the endpoint.
    #[error("cannot reach LLM runtime at {url}")]
    Unreachable { url: String },

    /// The request timed out at the transport level.
    #[error("runtime request timed out")]
    Timeout,

    /// The runtime answered with a non-success status.
    #[error("runtime error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// The requested model is not installed on the runtime.
    #[error("model '{0}' is not installed")]
    ModelMissing(String),

    /// The runtime answered, but not with the expected shape.
    #[error("malformed runtime response: {0}")]
    Protocol(String),

    /// The runtime binary is not installed and this client cannot
    /// install it.
    #[error("runtime not installed: {0}")]
    NotInstalled(String),
}

impl RuntimeError {
    /// Whether the retry loop may try again.
    pub fn is_transient(&self) -> bool {
        match self {
            RuntimeError::Unreachable { .. } | RuntimeError::Timeout => true,
            RuntimeError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Progress observer for model pulls (0–100).
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// The operations the pipeline needs from a local LLM runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Is the runtime process reachable right now?
    async fn probe(&self) -> bool;

    /// Make the runtime available, idempotently.
    ///
    /// Called only when [`probe`](Self::probe) failed. Implementations
    /// that manage the runtime process start it here; the plain HTTP
    /// client cannot and reports what the operator should do instead.
    async fn ensure_installed(&self) -> Result<(), RuntimeError>;

    /// Snapshot of installed models.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, RuntimeError>;

    /// Pull a model, reporting progress as the runtime streams it.
    async fn pull_model(&self, model: &str, on_progress: ProgressFn<'_>)
        -> Result<(), RuntimeError>;

    /// Run one inference call and return the completion text.
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, RuntimeError>;
}

// ── Ollama implementation ────────────────────────────────────────────────

/// HTTP client for an Ollama-compatible runtime.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

/// Timeout for quick control-plane calls (probe, tags).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

impl OllamaClient {
    /// Create a client for the given base URL (e.g. `http://127.0.0.1:11434`).
    ///
    /// No overall request timeout is set on the inner client: inference
    /// and pull calls are bounded by their callers
    /// ([`crate::pipeline::infer`] and the setup orchestrator), which own
    /// the timeout policy. Control-plane calls bound themselves.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONTROL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify(&self, e: reqwest::Error) -> RuntimeError {
        if e.is_connect() {
            RuntimeError::Unreachable {
                url: self.base_url.clone(),
            }
        } else if e.is_timeout() {
            RuntimeError::Timeout
        } else {
            RuntimeError::Protocol(e.to_string())
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

/// One NDJSON line of the pull stream.
#[derive(Deserialize)]
struct PullEvent {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl RuntimeClient for OllamaClient {
    async fn probe(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(CONTROL_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn ensure_installed(&self) -> Result<(), RuntimeError> {
        // Idempotent: a reachable runtime needs nothing.
        if self.probe().await {
            return Ok(());
        }
        Err(RuntimeError::NotInstalled(format!(
            "no runtime answering at {} — install Ollama and start it with `ollama serve`",
            self.base_url
        )))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, RuntimeError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size_bytes: m.size,
                installed: true,
            })
            .collect())
    }

    async fn pull_model(
        &self,
        model: &str,
        on_progress: ProgressFn<'_>,
    ) -> Result<(), RuntimeError> {
        let url = format!("{}/api/pull", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "name": model }))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        // The pull endpoint streams NDJSON events; layer progress is
        // reported as completed/total bytes for the largest layer.
        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        let mut last_pct: u8 = 0;
        on_progress(0);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.classify(e))?;
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event: PullEvent = match serde_json::from_str(line) {
                    Ok(e) => e,
                    Err(_) => continue, // tolerate unknown event shapes
                };
                if let Some(err) = event.error {
                    return Err(RuntimeError::Api {
                        status: 500,
                        body: err,
                    });
                }
                if let (Some(total), Some(done)) = (event.total, event.completed) {
                    if total > 0 {
                        let pct = ((done.saturating_mul(100)) / total).min(100) as u8;
                        if pct != last_pct {
                            last_pct = pct;
                            on_progress(pct);
                        }
                    }
                }
                if event.status == "success" {
                    on_progress(100);
                    debug!(model, "pull complete");
                    return Ok(());
                }
            }
        }

        // Stream ended without a success event.
        warn!(model, "pull stream ended without success status");
        Err(RuntimeError::Protocol(
            "pull stream ended unexpectedly".into(),
        ))
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, RuntimeError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            // Ollama reports an unknown model as 404 {"error": "model ... not found"}
            if status.as_u16() == 404 && text.contains("not found") {
                return Err(RuntimeError::ModelMissing(model.to_string()));
            }
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        Ok(parsed.response)
    }
}

// ── Mock implementation for tests ────────────────────────────────────────

/// Scripted in-memory runtime for tests.
///
/// Lives in non-test code so integration tests (and embedders writing
/// their own tests) can use it.
pub struct MockRuntime {
    reachable: std::sync::atomic::AtomicBool,
    models: std::sync::Mutex<Vec<String>>,
    /// Scripted generate outcomes, consumed front-to-back; when empty,
    /// `generate` echoes a canned success.
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, RuntimeError>>>,
    /// Every (model, prompt) pair passed to `generate`, in call order.
    prompts: std::sync::Mutex<Vec<(String, String)>>,
    fail_pull: std::sync::atomic::AtomicBool,
    /// Artificial latency before each `generate` answer.
    generate_delay: std::sync::Mutex<Option<Duration>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            reachable: std::sync::atomic::AtomicBool::new(true),
            models: std::sync::Mutex::new(Vec::new()),
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            prompts: std::sync::Mutex::new(Vec::new()),
            fail_pull: std::sync::atomic::AtomicBool::new(false),
            generate_delay: std::sync::Mutex::new(None),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(self, models: &[&str]) -> Self {
        *self.models.lock().unwrap() = models.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable
            .store(reachable, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_fail_pull(&self, fail: bool) {
        self.fail_pull
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Queue the outcome of the next `generate` call.
    pub fn push_response(&self, outcome: Result<String, RuntimeError>) {
        self.responses.lock().unwrap().push_back(outcome);
    }

    /// Make every `generate` call wait before answering (slow-runtime
    /// scenarios; pairs with paused-clock tests).
    pub fn set_generate_delay(&self, delay: Duration) {
        *self.generate_delay.lock().unwrap() = Some(delay);
    }

    /// Snapshot of every generate call so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeClient for MockRuntime {
    async fn probe(&self) -> bool {
        self.reachable.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn ensure_installed(&self) -> Result<(), RuntimeError> {
        if self.probe().await {
            Ok(())
        } else {
            Err(RuntimeError::NotInstalled("mock runtime offline".into()))
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, RuntimeError> {
        if !self.probe().await {
            return Err(RuntimeError::Unreachable {
                url: "mock".into(),
            });
        }
        Ok(self
            .models
            .lock()
            .unwrap()
            .iter()
            .map(|name| ModelInfo {
                name: name.clone(),
                size_bytes: Some(4_000_000_000),
                installed: true,
            })
            .collect())
    }

    async fn pull_model(
        &self,
        model: &str,
        on_progress: ProgressFn<'_>,
    ) -> Result<(), RuntimeError> {
        if self.fail_pull.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                body: "pull failed".into(),
            });
        }
        for pct in [0u8, 40, 80, 100] {
            on_progress(pct);
        }
        self.models.lock().unwrap().push(model.to_string());
        Ok(())
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, RuntimeError> {
        let delay = *self.generate_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.prompts
            .lock()
            .unwrap()
            .push((model.to_string(), prompt.to_string()));
        match self.responses.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(format!("analysis from {model}")),
        }
    }
}
