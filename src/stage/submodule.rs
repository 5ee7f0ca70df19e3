use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use log::{debug, warn};

use super::{guarded, guarded_setup, Stage};
use crate::core::{
    Lifecycle, Phase, PipelineError, PipelineResult, ProcessingContext, ProcessingResult,
};

/// Leaf behavior plugged into a [`SubModule`].
///
/// Handlers talk to providers; they may fail freely; the wrapping
/// submodule turns every error or panic into a failing result.
#[async_trait]
pub trait SubModuleHandler: Send + Sync {
    /// One-time provider-specific setup
    async fn setup(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Produce this submodule's output for one request
    async fn handle(&self, ctx: &ProcessingContext) -> PipelineResult<ProcessingResult>;
}

/// Leaf stage
pub struct SubModule {
    name: String,
    enabled: bool,
    lifecycle: Lifecycle,
    handler: Arc<dyn SubModuleHandler>,
}

impl SubModule {
    pub fn new(name: impl Into<String>, handler: Arc<dyn SubModuleHandler>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            lifecycle: Lifecycle::new(),
            handler,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Run the handler for one request.
    ///
    /// Never fails: errors, panics and deadline expiry all come back as a
    /// failing [`ProcessingResult`].
    pub async fn process(&self, ctx: &ProcessingContext) -> ProcessingResult {
        if !self.lifecycle.is_completed() {
            return ProcessingResult::failure(format!(
                "submodule {} is not initialized ({})",
                self.name,
                self.phase().as_str()
            ));
        }

        let started = Instant::now();
        let outcome = guarded(
            &self.name,
            ctx.bounded(&self.name, self.handler.handle(ctx)),
        )
        .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => {
                debug!(
                    "Submodule {} finished in {:.2}ms (success: {})",
                    self.name,
                    elapsed_ms,
                    result.is_success()
                );
                result.with_metadata("elapsed_ms", elapsed_ms)
            }
            Err(err) => {
                warn!("Submodule {} failed: {}", self.name, err);
                let err = match err {
                    err @ (PipelineError::StageProcessing { .. } | PipelineError::Timeout(_)) => err,
                    other => PipelineError::stage(&self.name, other.to_string()),
                };
                ProcessingResult::from_error(&err).with_metadata("elapsed_ms", elapsed_ms)
            }
        }
    }
}

#[async_trait]
impl Stage for SubModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    async fn initialize(&self) -> bool {
        self.lifecycle
            .run(|| guarded_setup(&self.name, self.handler.setup()))
            .await
    }

    fn reset(&self) {
        self.lifecycle.reset();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::core::DataMap;

    struct Counting {
        setups: AtomicUsize,
        fail_setup: bool,
    }

    #[async_trait]
    impl SubModuleHandler for Counting {
        async fn setup(&self) -> PipelineResult<()> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                return Err(PipelineError::Provider("backend down".into()));
            }
            Ok(())
        }

        async fn handle(&self, ctx: &ProcessingContext) -> PipelineResult<ProcessingResult> {
            if ctx.query() == "panic" {
                panic!("handler exploded");
            }
            if ctx.query() == "slow" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(ProcessingResult::success_value(json!({"echo": ctx.query()})))
        }
    }

    fn counting(fail_setup: bool) -> Arc<Counting> {
        Arc::new(Counting {
            setups: AtomicUsize::new(0),
            fail_setup,
        })
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let handler = counting(false);
        let sub = SubModule::new("echo", handler.clone());

        assert!(sub.initialize().await);
        assert!(sub.initialize().await);
        assert_eq!(handler.setups.load(Ordering::SeqCst), 1);
        assert_eq!(sub.phase(), Phase::Completed);
    }

    #[tokio::test]
    async fn test_failed_setup_sets_error_phase() {
        let sub = SubModule::new("echo", counting(true));
        assert!(!sub.initialize().await);
        assert_eq!(sub.phase(), Phase::Error);

        let ctx = ProcessingContext::new("u", "hi", DataMap::new());
        assert!(!sub.process(&ctx).await.is_success());
    }

    #[tokio::test]
    async fn test_panic_becomes_failing_result() {
        let sub = SubModule::new("echo", counting(false));
        sub.initialize().await;

        let ctx = ProcessingContext::new("u", "panic", DataMap::new());
        let result = sub.process(&ctx).await;
        assert!(!result.is_success());
        assert!(result.error_message().unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_deadline_reports_timeout() {
        let sub = SubModule::new("echo", counting(false));
        sub.initialize().await;

        let ctx = ProcessingContext::new("u", "slow", DataMap::new())
            .with_timeout(Duration::from_millis(20));
        let result = sub.process(&ctx).await;
        assert!(!result.is_success());
        assert_eq!(result.metadata().get("error_code"), Some(&json!("timeout")));
    }
}
