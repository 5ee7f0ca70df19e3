use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, warn};
use serde_json::Value;

use super::{
    guarded, guarded_setup, initialize_all, log_failed_children, Stage, StageResults, StageStatus,
    SubModule,
};
use crate::core::{
    qualified_name, DataMap, Lifecycle, Phase, PipelineError, PipelineResult, ProcessingContext,
    ProcessingResult,
};

/// Optional custom behavior for a [`Module`].
///
/// Without a handler a module runs all of its submodules and aggregates
/// their successful outputs with [`aggregate_submodules`].
#[async_trait]
pub trait ModuleHandler: Send + Sync {
    async fn setup(&self) -> PipelineResult<()> {
        Ok(())
    }

    async fn handle(
        &self,
        module: &Module,
        ctx: &mut ProcessingContext,
    ) -> PipelineResult<ProcessingResult>;
}

/// Mid-level stage owning an ordered set of submodules
pub struct Module {
    name: String,
    enabled: bool,
    parallel: bool,
    lifecycle: Lifecycle,
    submodules: Vec<SubModule>,
    handler: Option<Arc<dyn ModuleHandler>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            parallel: false,
            lifecycle: Lifecycle::new(),
            submodules: Vec::new(),
            handler: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Run submodules concurrently. They all see the context as it was
    /// before the module started.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ModuleHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Append a submodule. Names must be unique within the module.
    pub fn add_submodule(&mut self, submodule: SubModule) -> PipelineResult<()> {
        if self.get_submodule(submodule.name()).is_some() {
            return Err(crate::config_error!(
                "duplicate submodule {} in module {}",
                submodule.name(),
                self.name
            ));
        }
        self.submodules.push(submodule);
        Ok(())
    }

    pub fn get_submodule(&self, name: &str) -> Option<&SubModule> {
        self.submodules.iter().find(|s| s.name() == name)
    }

    pub fn submodules(&self) -> &[SubModule] {
        &self.submodules
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Run enabled submodules, optionally restricted to `only`, and record
    /// every result under `"module.submodule"` in the context.
    ///
    /// The returned results keep declaration order whatever the completion
    /// order was.
    pub async fn process_submodules(
        &self,
        ctx: &mut ProcessingContext,
        only: Option<&[&str]>,
    ) -> StageResults {
        let selected: Vec<&SubModule> = self
            .submodules
            .iter()
            .filter(|s| s.is_enabled())
            .filter(|s| only.map_or(true, |names| names.iter().any(|n| *n == s.name())))
            .collect();

        let mut results = StageResults::new();

        if self.parallel {
            let shared: &ProcessingContext = ctx;
            let outputs = join_all(selected.iter().map(|s| s.process(shared))).await;
            for (submodule, result) in selected.iter().zip(outputs) {
                let result = self.record(ctx, submodule.name(), result);
                results.push(submodule.name().to_string(), result);
            }
        } else {
            for submodule in selected {
                let result = submodule.process(ctx).await;
                let result = self.record(ctx, submodule.name(), result);
                results.push(submodule.name().to_string(), result);
            }
        }

        let failed = results.failed();
        if !failed.is_empty() {
            warn!("Module {}: submodules failed: {}", self.name, failed.join(", "));
        }
        results
    }

    fn record(
        &self,
        ctx: &mut ProcessingContext,
        submodule: &str,
        result: ProcessingResult,
    ) -> ProcessingResult {
        let key = qualified_name(&self.name, submodule);
        match ctx.insert_submodule_output(key, result.clone()) {
            Ok(()) => result,
            Err(err) => {
                error!("Module {}: {}", self.name, err);
                ProcessingResult::from_error(&err)
            }
        }
    }

    /// Run the module for one request. Never fails.
    pub async fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        if !self.lifecycle.is_completed() {
            return ProcessingResult::failure(format!(
                "module {} is not initialized ({})",
                self.name,
                self.phase().as_str()
            ));
        }

        let outcome = match &self.handler {
            Some(handler) => guarded(&self.name, handler.handle(self, ctx)).await,
            None => {
                let results = self.process_submodules(ctx, None).await;
                Ok(aggregate_submodules(&results))
            }
        };

        outcome.unwrap_or_else(|err| {
            warn!("Module {} failed: {}", self.name, err);
            let err = match err {
                err @ PipelineError::StageProcessing { .. } => err,
                other => PipelineError::stage(&self.name, other.to_string()),
            };
            ProcessingResult::from_error(&err)
        })
    }
}

/// Fold submodule results into one successful module result.
///
/// Each successful submodule contributes its data under its own name;
/// failures are listed in the `failed_submodules` metadata only.
pub fn aggregate_submodules(results: &StageResults) -> ProcessingResult {
    let mut data = DataMap::new();
    for (name, result) in results.iter().filter(|(_, r)| r.is_success()) {
        data.insert(name.to_string(), Value::Object(result.data().clone()));
    }

    let failed: Vec<Value> = results
        .failed()
        .into_iter()
        .map(|n| Value::String(n.to_string()))
        .collect();
    debug!(
        "Aggregated {} submodule results ({} failed)",
        results.len(),
        failed.len()
    );

    ProcessingResult::success(data)
        .with_metadata("submodule_count", results.len())
        .with_metadata("failed_submodules", failed)
}

#[async_trait]
impl Stage for Module {
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
            .run(|| async {
                if let Some(handler) = &self.handler {
                    if !guarded_setup(&self.name, handler.setup()).await {
                        return false;
                    }
                }
                let outcomes = initialize_all(&self.submodules).await;
                log_failed_children(&self.name, &outcomes);
                true
            })
            .await
    }

    fn reset(&self) {
        self.lifecycle.reset();
        self.submodules.iter().for_each(Stage::reset);
    }

    fn status(&self) -> StageStatus {
        StageStatus {
            name: self.name.clone(),
            enabled: self.enabled,
            phase: self.phase(),
            children: self.submodules.iter().map(Stage::status).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::stage::SubModuleHandler;

    struct Fixed {
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl SubModuleHandler for Fixed {
        async fn handle(&self, _ctx: &ProcessingContext) -> PipelineResult<ProcessingResult> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                return Err(PipelineError::Provider("no answer".into()));
            }
            Ok(ProcessingResult::success_value(json!({"delay": self.delay_ms})))
        }
    }

    fn sub(name: &str, delay_ms: u64, fail: bool) -> SubModule {
        SubModule::new(name, Arc::new(Fixed { delay_ms, fail }))
    }

    fn module(parallel: bool) -> Module {
        let mut module = Module::new("analysis").with_parallel(parallel);
        module.add_submodule(sub("slow", 40, false)).unwrap();
        module.add_submodule(sub("broken", 0, true)).unwrap();
        module.add_submodule(sub("fast", 1, false)).unwrap();
        module
            .add_submodule(sub("off", 0, false).with_enabled(false))
            .unwrap();
        module
    }

    #[test]
    fn test_duplicate_submodule_rejected() {
        let mut module = Module::new("m");
        module.add_submodule(sub("a", 0, false)).unwrap();
        assert!(module.add_submodule(sub("a", 0, false)).is_err());
    }

    #[tokio::test]
    async fn test_parallel_results_keep_declaration_order() {
        let module = module(true);
        assert!(module.initialize().await);

        let mut ctx = ProcessingContext::new("u", "q", DataMap::new());
        let results = module.process_submodules(&mut ctx, None).await;

        let names: Vec<&str> = results.names().collect();
        assert_eq!(names, vec!["slow", "broken", "fast"]);
        assert_eq!(results.failed(), vec!["broken"]);

        // failures stay visible in the context
        assert!(!ctx.submodule_outputs()["analysis.broken"].is_success());
        assert!(!ctx.submodule_outputs().contains_key("analysis.off"));
    }

    #[tokio::test]
    async fn test_filter_selects_submodules() {
        let module = module(false);
        module.initialize().await;

        let mut ctx = ProcessingContext::new("u", "q", DataMap::new());
        let results = module.process_submodules(&mut ctx, Some(&["fast"][..])).await;
        assert_eq!(results.len(), 1);
        assert_eq!(ctx.submodule_outputs().len(), 1);
    }

    #[tokio::test]
    async fn test_default_process_tolerates_submodule_failure() {
        let module = module(false);
        module.initialize().await;

        let mut ctx = ProcessingContext::new("u", "q", DataMap::new());
        let result = module.process(&mut ctx).await;

        assert!(result.is_success());
        assert!(result.get("slow").is_some());
        assert!(result.get("broken").is_none());
        assert_eq!(
            result.metadata().get("failed_submodules"),
            Some(&json!(["broken"]))
        );
    }

    #[tokio::test]
    async fn test_processing_twice_does_not_overwrite() {
        let module = module(false);
        module.initialize().await;

        let mut ctx = ProcessingContext::new("u", "q", DataMap::new());
        module.process_submodules(&mut ctx, Some(&["fast"][..])).await;
        let again = module.process_submodules(&mut ctx, Some(&["fast"][..])).await;

        assert!(!again.get("fast").unwrap().is_success());
        assert!(ctx.submodule_outputs()["analysis.fast"].is_success());
    }

    struct NoBackend;

    #[async_trait]
    impl SubModuleHandler for NoBackend {
        async fn setup(&self) -> PipelineResult<()> {
            Err(PipelineError::Provider("backend unreachable".into()))
        }

        async fn handle(&self, _ctx: &ProcessingContext) -> PipelineResult<ProcessingResult> {
            Ok(ProcessingResult::success(DataMap::new()))
        }
    }

    #[tokio::test]
    async fn test_failed_child_setup_leaves_module_ready() {
        let mut module = Module::new("recall");
        module
            .add_submodule(SubModule::new("search", Arc::new(NoBackend)))
            .unwrap();

        assert!(module.initialize().await);
        assert_eq!(module.phase(), Phase::Completed);
        assert_eq!(module.get_submodule("search").unwrap().phase(), Phase::Error);

        let mut ctx = ProcessingContext::new("u", "q", DataMap::new());
        let result = module.process(&mut ctx).await;
        assert!(result.is_success());
        assert!(!ctx.submodule_outputs()["recall.search"].is_success());
    }
}
