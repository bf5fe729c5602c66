//! Inference calls with timeout, retry, and failure-streak accounting.
//!
//! ## Retry Strategy
//!
//! Connection-refused and 5xx failures from a local runtime are transient
//! and frequent — the service restarts, the model reloads, the box swaps.
//! Exponential backoff (`retry_backoff_ms * 2^attempt`) avoids hammering a
//! recovering runtime: with the 500 ms base and 2 retries the wait
//! sequence is 500 ms → 1 s. Permanent failures (unknown model, malformed
//! request) are never retried — they would fail identically every time.
//!
//! ## Failure streaks
//!
//! A runtime that fails every call should not be rediscovered from scratch
//! by every job. [`FailureTracker`] counts consecutive exhausted calls
//! across jobs; past the threshold the error surfaces as
//! `RuntimeUnavailable`, pointing the operator at setup instead of at the
//! document. Any success resets the streak.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::runtime::{RuntimeClient, RuntimeError};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Consecutive-failure counter shared by all jobs.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive: AtomicU32,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_failure(&self) -> u32 {
        self.consecutive.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    /// Current streak length (observability).
    pub fn streak(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

/// Run one inference call against the runtime.
///
/// Applies the hard per-call timeout, retries transient failures up to
/// `config.max_retries` times with exponential backoff, and converts the
/// final failure into the job-facing [`AnalysisError`] taxonomy.
pub async fn infer(
    client: &dyn RuntimeClient,
    model: &str,
    prompt: &str,
    config: &AnalysisConfig,
    tracker: &FailureTracker,
) -> Result<String, AnalysisError> {
    let mut last_err: Option<RuntimeError> = None;
    let mut timed_out = false;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(model, attempt, max = config.max_retries, backoff_ms = backoff, "retrying inference");
            sleep(Duration::from_millis(backoff)).await;
        }

        match timeout(config.infer_timeout, client.generate(model, prompt)).await {
            Ok(Ok(text)) => {
                debug!(model, chars = text.len(), "inference succeeded");
                tracker.record_success();
                return Ok(text);
            }
            Ok(Err(e)) => {
                timed_out = matches!(e, RuntimeError::Timeout);
                let transient = e.is_transient();
                warn!(model, attempt, error = %e, "inference attempt failed");
                last_err = Some(e);
                if !transient {
                    break;
                }
            }
            Err(_elapsed) => {
                timed_out = true;
                warn!(
                    model,
                    attempt,
                    secs = config.infer_timeout.as_secs(),
                    "inference attempt hit hard timeout"
                );
                last_err = Some(RuntimeError::Timeout);
            }
        }
    }

    let streak = tracker.record_failure();
    if streak >= config.failure_threshold {
        return Err(AnalysisError::RuntimeUnavailable {
            reason: format!("{streak} consecutive inference failures"),
        });
    }

    match last_err {
        Some(RuntimeError::Unreachable { url }) => Err(AnalysisError::RuntimeUnavailable {
            reason: format!("no runtime answering at {url}"),
        }),
        _ if timed_out => Err(AnalysisError::InferenceTimeout {
            model: model.to_string(),
            secs: config.infer_timeout.as_secs(),
        }),
        Some(e) => Err(AnalysisError::Inference {
            reason: e.to_string(),
        }),
        None => Err(AnalysisError::Internal("inference loop ran no attempt".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn config() -> AnalysisConfig {
        AnalysisConfig::builder()
            .max_retries(2)
            .retry_backoff_ms(10)
            .infer_timeout(Duration::from_secs(300))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt() {
        let mock = MockRuntime::new();
        mock.push_response(Ok("the answer".into()));
        let tracker = FailureTracker::new();

        let out = infer(&mock, "llama3.2", "prompt", &config(), &tracker)
            .await
            .unwrap();
        assert_eq!(out, "the answer");
        assert_eq!(mock.calls().len(), 1);
        assert_eq!(tracker.streak(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_then_succeeds() {
        let mock = MockRuntime::new();
        mock.push_response(Err(RuntimeError::Api {
            status: 503,
            body: "loading".into(),
        }));
        mock.push_response(Ok("recovered".into()));
        let tracker = FailureTracker::new();

        let out = infer(&mock, "llama3.2", "prompt", &config(), &tracker)
            .await
            .unwrap();
        assert_eq!(out, "recovered");
        assert_eq!(mock.calls().len(), 2);
        assert_eq!(tracker.streak(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let mock = MockRuntime::new();
        mock.push_response(Err(RuntimeError::ModelMissing("llama3.2".into())));
        let tracker = FailureTracker::new();

        let err = infer(&mock, "llama3.2", "prompt", &config(), &tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Inference { .. }));
        assert_eq!(mock.calls().len(), 1, "no retry on permanent failure");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_on_every_retry_maps_to_inference_timeout() {
        let mock = MockRuntime::new();
        for _ in 0..3 {
            mock.push_response(Err(RuntimeError::Timeout));
        }
        let tracker = FailureTracker::new();

        let err = infer(&mock, "llama3.2", "prompt", &config(), &tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InferenceTimeout { .. }));
        assert_eq!(mock.calls().len(), 3, "initial attempt + 2 retries");
        assert_eq!(tracker.streak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_streak_surfaces_runtime_unavailable() {
        let mock = MockRuntime::new();
        let tracker = FailureTracker::new();
        let cfg = config();

        // Three exhausted calls in a row crosses the default threshold (3).
        for i in 0..3 {
            for _ in 0..=cfg.max_retries {
                mock.push_response(Err(RuntimeError::Timeout));
            }
            let err = infer(&mock, "llama3.2", "p", &cfg, &tracker).await.unwrap_err();
            if i < 2 {
                assert!(matches!(err, AnalysisError::InferenceTimeout { .. }));
            } else {
                assert!(matches!(err, AnalysisError::RuntimeUnavailable { .. }));
            }
        }
        assert_eq!(tracker.streak(), 3);

        // A success clears the streak.
        mock.push_response(Ok("back".into()));
        infer(&mock, "llama3.2", "p", &cfg, &tracker).await.unwrap();
        assert_eq!(tracker.streak(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_after_retries_maps_to_runtime_unavailable() {
        let mock = MockRuntime::new();
        for _ in 0..3 {
            mock.push_response(Err(RuntimeError::Unreachable {
                url: "http://127.0.0.1:11434".into(),
            }));
        }
        let tracker = FailureTracker::new();

        let err = infer(&mock, "llama3.2", "prompt", &config(), &tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::RuntimeUnavailable { .. }));
    }
}
