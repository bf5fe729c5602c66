//! The operations facade handed to the request-handling layer.
//!
//! [`AnalysisService`] wires every component together — settings, file
//! store, runtime client, setup orchestrator, job coordinator, prompt
//! store — and exposes exactly the operation set an HTTP (or any other)
//! front end needs. The front end maps verbs to these methods and renders
//! the results; it never touches a path, a lock, or the runtime directly.
//!
//! Construction requires a Tokio runtime context: the service spawns the
//! periodic cleanup sweep on creation so the retention guarantee holds for
//! the whole process lifetime.

use crate::config::{AnalysisConfig, Settings};
use crate::error::AnalysisError;
use crate::job::{AnalysisJob, JobCoordinator};
use crate::prompts::PromptStore;
use crate::ratelimit::RateLimiter;
use crate::runtime::{is_allowed_model, ModelInfo, OllamaClient, RuntimeClient};
use crate::setup::{SetupOrchestrator, SetupState};
use crate::store::FileStore;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

/// Everything the (excluded) request-handling layer may do.
pub struct AnalysisService {
    config: AnalysisConfig,
    settings: Mutex<Settings>,
    client: Arc<dyn RuntimeClient>,
    setup: Arc<SetupOrchestrator>,
    coordinator: Arc<JobCoordinator>,
    prompts: PromptStore,
    /// Separate limiter for the cheap control operations (prompt edits,
    /// model selection); submissions are limited inside the coordinator.
    control_limiter: RateLimiter,
    _sweeper: tokio::task::JoinHandle<()>,
}

impl AnalysisService {
    /// Build the service against the runtime endpoint from persisted
    /// settings (overridable via [`crate::config::RUNTIME_URL_ENV`]).
    pub fn new(config: AnalysisConfig) -> Result<Arc<Self>, AnalysisError> {
        let settings = Settings::load(&config.data_dir);
        let client: Arc<dyn RuntimeClient> = Arc::new(OllamaClient::new(&settings.runtime_url));
        Self::with_client(config, settings, client)
    }

    /// Build against an explicit runtime client (tests, embedders).
    pub fn with_client(
        config: AnalysisConfig,
        settings: Settings,
        client: Arc<dyn RuntimeClient>,
    ) -> Result<Arc<Self>, AnalysisError> {
        let store = Arc::new(FileStore::new(&config)?);
        let setup = Arc::new(SetupOrchestrator::new(Arc::clone(&client), &config));
        let coordinator = Arc::new(JobCoordinator::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&client),
            Arc::clone(&setup),
        ));
        let sweeper = store.spawn_sweeper(config.sweep_interval);
        let prompts = PromptStore::new(&config.data_dir);
        let control_limiter = RateLimiter::new(config.rate_limit, config.rate_window);

        info!(
            runtime = %settings.runtime_url,
            model = %settings.model,
            "analysis service ready"
        );
        Ok(Arc::new(Self {
            config,
            settings: Mutex::new(settings),
            client,
            setup,
            coordinator,
            prompts,
            control_limiter,
            _sweeper: sweeper,
        }))
    }

    // ── Setup ────────────────────────────────────────────────────────────

    /// Current bootstrap snapshot. Non-blocking; poll at will.
    pub fn setup_status(&self) -> SetupState {
        self.setup.current_state()
    }

    /// Begin (or retry) the bootstrap for the currently selected model.
    pub fn start_setup(&self) -> Result<(), AnalysisError> {
        let model = self.settings().model;
        self.setup.start(&model)
    }

    /// Select the active model, persist the choice, and (re-)enter the
    /// bootstrap so it gets pulled and verified.
    pub fn select_model(&self, model: &str, client_key: &str) -> Result<(), AnalysisError> {
        if !self.control_limiter.admit(client_key) {
            return Err(AnalysisError::RateLimited);
        }
        if !is_allowed_model(model) {
            return Err(AnalysisError::ModelNotAllowed {
                model: model.to_string(),
            });
        }
        {
            let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.model = model.to_string();
            settings.save(&self.config.data_dir)?;
        }
        self.setup.start(model)
    }

    // ── Jobs ─────────────────────────────────────────────────────────────

    /// Submit a document; returns the accepted job snapshot or a
    /// rejection (rate-limited / not-ready / busy / invalid).
    pub fn submit(
        &self,
        bytes: &[u8],
        declared_name: &str,
        client_key: &str,
    ) -> Result<AnalysisJob, AnalysisError> {
        let template = self.prompts.get();
        self.coordinator
            .submit(bytes, declared_name, client_key, &template)
    }

    /// Status snapshot for a job.
    pub fn job(&self, id: Uuid) -> Option<AnalysisJob> {
        self.coordinator.job(id)
    }

    /// Result artifact bytes plus the suggested download name.
    pub fn fetch_result(&self, id: Uuid) -> Result<(Vec<u8>, String), AnalysisError> {
        let bytes = self.coordinator.fetch_result(id)?;
        let name = self
            .coordinator
            .job(id)
            .map(|j| j.download_name)
            .unwrap_or_else(|| "analysis.txt".to_string());
        Ok((bytes, name))
    }

    // ── Prompt template ──────────────────────────────────────────────────

    pub fn prompt(&self) -> String {
        self.prompts.get()
    }

    pub fn set_prompt(&self, template: &str, client_key: &str) -> Result<(), AnalysisError> {
        if !self.control_limiter.admit(client_key) {
            return Err(AnalysisError::RateLimited);
        }
        self.prompts.set(template)?;
        Ok(())
    }

    // ── Models / settings ────────────────────────────────────────────────

    /// Registry snapshot from the runtime, filtered to allowed names.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, AnalysisError> {
        let models = self
            .client
            .list_models()
            .await
            .map_err(|e| AnalysisError::RuntimeUnavailable {
                reason: e.to_string(),
            })?;
        Ok(models
            .into_iter()
            .filter(|m| is_allowed_model(&m.name))
            .collect())
    }

    /// Copy of the persisted settings.
    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
