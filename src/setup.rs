//! Bootstrap state machine for the local LLM runtime.
//!
//! The orchestrator owns the process-wide [`SetupState`] singleton: it is
//! the only writer, every mutation happens inside its spawned bootstrap
//! task, and pollers read consistent snapshots through a `watch` channel.
//! That makes the ownership and mutation path explicit instead of leaking
//! ambient global state.
//!
//! ## The state chain
//!
//! ```text
//! Uninitialized → CheckingRuntime → [InstallingRuntime] → RuntimeReady
//!               → [PullingModel 0–100] → ModelReady
//! ```
//!
//! Transitions only move forward along the chain, except that any step may
//! fall to `Error` on unrecoverable failure or step timeout. `Error` is
//! cleared only by an explicit new [`SetupOrchestrator::start`] /
//! [`SetupOrchestrator::retry`] request, which re-enters
//! `CheckingRuntime`. The install and pull steps are each bounded by a
//! maximum wait so a wedged runtime turns into a diagnosable `Error`
//! instead of a silent hang.
//!
//! ## Polling contract
//!
//! [`SetupOrchestrator::current_state`] is non-blocking and always returns
//! the latest snapshot; the orchestrator never pushes. Polling cadence and
//! rendering are entirely the caller's concern.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::runtime::{is_allowed_model, ModelInfo, RuntimeClient};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info};

/// Phase of the runtime bootstrap. Process-wide singleton, mutated only
/// by the [`SetupOrchestrator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SetupState {
    Uninitialized,
    CheckingRuntime,
    InstallingRuntime,
    RuntimeReady,
    PullingModel { model: String, progress: u8 },
    ModelReady { model: String },
    Error { message: String },
}

impl SetupState {
    /// The model that is ready for inference, if any.
    pub fn ready_model(&self) -> Option<&str> {
        match self {
            SetupState::ModelReady { model } => Some(model),
            _ => None,
        }
    }
}

/// Drives the runtime from cold to `ModelReady` for a selected model.
pub struct SetupOrchestrator {
    client: Arc<dyn RuntimeClient>,
    state_tx: watch::Sender<SetupState>,
    state_rx: watch::Receiver<SetupState>,
    install_timeout: Duration,
    pull_timeout: Duration,
    in_flight: AtomicBool,
    requested_model: Mutex<Option<String>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SetupOrchestrator {
    pub fn new(client: Arc<dyn RuntimeClient>, config: &AnalysisConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(SetupState::Uninitialized);
        Self {
            client,
            state_tx,
            state_rx,
            install_timeout: config.install_timeout,
            pull_timeout: config.pull_timeout,
            in_flight: AtomicBool::new(false),
            requested_model: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Non-blocking snapshot of the current state.
    pub fn current_state(&self) -> SetupState {
        self.state_rx.borrow().clone()
    }

    /// Begin (or, from `Error`, explicitly retry) the bootstrap for
    /// `model`. Returns immediately; poll [`current_state`](Self::current_state)
    /// for progress.
    ///
    /// Selecting a different model while another is already `ModelReady`
    /// re-enters the pull for the new model — readiness is per model, not
    /// a global flag.
    pub fn start(self: &Arc<Self>, model: &str) -> Result<(), AnalysisError> {
        if !is_allowed_model(model) {
            return Err(AnalysisError::ModelNotAllowed {
                model: model.to_string(),
            });
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(AnalysisError::Busy);
        }

        *self
            .requested_model
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(model.to_string());

        info!(model, "setup requested");
        let this = Arc::clone(self);
        let model = model.to_string();
        let handle = tokio::spawn(async move {
            this.run(&model).await;
            this.in_flight.store(false, Ordering::SeqCst);
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Explicit retry after `Error`, re-entering `CheckingRuntime` with
    /// the last requested model.
    pub fn retry(self: &Arc<Self>) -> Result<(), AnalysisError> {
        let model = self
            .requested_model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| AnalysisError::Validation {
                reason: "no model has been requested yet".into(),
            })?;
        self.start(&model)
    }

    /// Await the in-flight bootstrap task, if any. Used by tests and
    /// shutdown paths; pollers never need it.
    pub async fn wait_idle(&self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ── Bootstrap task ───────────────────────────────────────────────────

    async fn run(&self, model: &str) {
        self.set(SetupState::CheckingRuntime);

        if !self.client.probe().await {
            self.set(SetupState::InstallingRuntime);
            match timeout(self.install_timeout, self.client.ensure_installed()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return self.fail(format!("runtime install failed: {e}")),
                Err(_) => {
                    return self.fail(format!(
                        "runtime install timed out after {}s",
                        self.install_timeout.as_secs()
                    ))
                }
            }
        }
        self.set(SetupState::RuntimeReady);

        let installed = match self.client.list_models().await {
            Ok(models) => models,
            Err(e) => return self.fail(format!("could not read model registry: {e}")),
        };

        if !registry_has(&installed, model) {
            self.set(SetupState::PullingModel {
                model: model.to_string(),
                progress: 0,
            });

            let on_progress = |pct: u8| {
                self.set(SetupState::PullingModel {
                    model: model.to_string(),
                    progress: pct,
                });
            };
            match timeout(self.pull_timeout, self.client.pull_model(model, &on_progress)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return self.fail(format!("model pull failed: {e}")),
                Err(_) => {
                    return self.fail(format!(
                        "model pull timed out after {}s",
                        self.pull_timeout.as_secs()
                    ))
                }
            }

            // ModelReady must never be reported while the registry
            // disagrees, so re-read it rather than trusting the pull.
            match self.client.list_models().await {
                Ok(models) if registry_has(&models, model) => {}
                Ok(_) => return self.fail(format!("model '{model}' absent after pull")),
                Err(e) => return self.fail(format!("could not verify model registry: {e}")),
            }
        }

        info!(model, "setup complete");
        self.set(SetupState::ModelReady {
            model: model.to_string(),
        });
    }

    fn set(&self, state: SetupState) {
        self.state_tx.send_replace(state);
    }

    fn fail(&self, message: String) {
        error!("setup failed: {message}");
        self.set(SetupState::Error { message });
    }
}

fn registry_has(models: &[ModelInfo], name: &str) -> bool {
    models
        .iter()
        .any(|m| m.installed && (m.name == name || m.name.starts_with(&format!("{name}:"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RuntimeError};
    use async_trait::async_trait;

    fn orchestrator(mock: MockRuntime) -> Arc<SetupOrchestrator> {
        let config = AnalysisConfig::default();
        Arc::new(SetupOrchestrator::new(Arc::new(mock), &config))
    }

    #[tokio::test]
    async fn starts_uninitialized() {
        let orch = orchestrator(MockRuntime::new());
        assert_eq!(orch.current_state(), SetupState::Uninitialized);
    }

    #[tokio::test]
    async fn reachable_runtime_with_model_goes_straight_to_ready() {
        let orch = orchestrator(MockRuntime::new().with_models(&["llama3.2:3b"]));
        orch.start("llama3.2").unwrap();
        orch.wait_idle().await;
        assert_eq!(
            orch.current_state(),
            SetupState::ModelReady {
                model: "llama3.2".into()
            }
        );
    }

    #[tokio::test]
    async fn missing_model_is_pulled_then_ready() {
        let orch = orchestrator(MockRuntime::new());
        orch.start("mistral").unwrap();
        orch.wait_idle().await;
        assert_eq!(orch.current_state().ready_model(), Some("mistral"));
    }

    #[tokio::test]
    async fn unreachable_runtime_ends_in_error_until_retry() {
        let mock = MockRuntime::new();
        mock.set_reachable(false);
        let orch = orchestrator(mock);

        orch.start("llama3.2").unwrap();
        orch.wait_idle().await;
        let state = orch.current_state();
        assert!(matches!(state, SetupState::Error { .. }), "got {state:?}");

        // Error persists across polls; only an explicit retry clears it.
        assert!(matches!(orch.current_state(), SetupState::Error { .. }));
    }

    #[tokio::test]
    async fn retry_after_error_reaches_ready() {
        let mock = MockRuntime::new();
        mock.set_fail_pull(true);
        let orch = {
            let config = AnalysisConfig::default();
            let mock = Arc::new(mock);
            let orch = Arc::new(SetupOrchestrator::new(
                Arc::clone(&mock) as Arc<dyn RuntimeClient>,
                &config,
            ));
            (orch, mock)
        };
        let (orch, mock) = orch;

        orch.start("llama3.2").unwrap();
        orch.wait_idle().await;
        assert!(matches!(orch.current_state(), SetupState::Error { .. }));

        mock.set_fail_pull(false);
        orch.retry().unwrap();
        orch.wait_idle().await;
        assert_eq!(orch.current_state().ready_model(), Some("llama3.2"));
    }

    #[tokio::test]
    async fn rejects_disallowed_model_without_state_change() {
        let orch = orchestrator(MockRuntime::new());
        let err = orch.start("rm -rf /").unwrap_err();
        assert!(matches!(err, AnalysisError::ModelNotAllowed { .. }));
        assert_eq!(orch.current_state(), SetupState::Uninitialized);
    }

    #[tokio::test]
    async fn switching_model_re_pulls_for_the_new_one() {
        let orch = orchestrator(MockRuntime::new().with_models(&["llama3.2"]));
        orch.start("llama3.2").unwrap();
        orch.wait_idle().await;
        assert_eq!(orch.current_state().ready_model(), Some("llama3.2"));

        // Readiness for llama3.2 does not carry over to mistral.
        orch.start("mistral").unwrap();
        orch.wait_idle().await;
        assert_eq!(orch.current_state().ready_model(), Some("mistral"));
    }

    #[tokio::test]
    async fn pull_failure_reports_error() {
        let mock = MockRuntime::new();
        mock.set_fail_pull(true);
        let orch = orchestrator(mock);
        orch.start("gemma").unwrap();
        orch.wait_idle().await;
        match orch.current_state() {
            SetupState::Error { message } => assert!(message.contains("pull")),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    // A runtime whose install step never completes, for timeout coverage.
    struct HangingRuntime;

    #[async_trait]
    impl RuntimeClient for HangingRuntime {
        async fn probe(&self) -> bool {
            false
        }
        async fn ensure_installed(&self) -> Result<(), RuntimeError> {
            std::future::pending().await
        }
        async fn list_models(&self) -> Result<Vec<ModelInfo>, RuntimeError> {
            Ok(Vec::new())
        }
        async fn pull_model(
            &self,
            _model: &str,
            _on_progress: crate::runtime::ProgressFn<'_>,
        ) -> Result<(), RuntimeError> {
            std::future::pending().await
        }
        async fn generate(&self, _model: &str, _prompt: &str) -> Result<String, RuntimeError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn install_step_times_out_into_error() {
        let config = AnalysisConfig::builder()
            .install_timeout(Duration::from_secs(300))
            .build()
            .unwrap();
        let orch = Arc::new(SetupOrchestrator::new(Arc::new(HangingRuntime), &config));
        orch.start("llama3.2").unwrap();
        orch.wait_idle().await;
        match orch.current_state() {
            SetupState::Error { message } => {
                assert!(message.contains("timed out"), "got: {message}")
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_bootstrapping_is_busy() {
        let config = AnalysisConfig::default();
        let orch = Arc::new(SetupOrchestrator::new(Arc::new(HangingRuntime), &config));
        orch.start("llama3.2").unwrap();
        // The first bootstrap is pinned in the hanging install step.
        let err = orch.start("llama3.2").unwrap_err();
        assert!(matches!(err, AnalysisError::Busy));
        orch.wait_idle().await;
    }
}
