use std::sync::Arc;

use async_trait::async_trait;
use log::{error, warn};

use super::{
    guarded, guarded_setup, initialize_all, log_failed_children, Module, Stage, StageResults,
    StageStatus,
};
use crate::core::{
    qualified_name, ChunkStream, Lifecycle, Phase, PipelineError, PipelineResult,
    ProcessingContext, ProcessingResult,
};

/// Business logic of a [`Layer`]: how its modules are sequenced and how
/// their outputs are combined.
#[async_trait]
pub trait LayerHandler: Send + Sync {
    async fn setup(&self) -> PipelineResult<()> {
        Ok(())
    }

    async fn process(
        &self,
        layer: &Layer,
        ctx: &mut ProcessingContext,
    ) -> PipelineResult<ProcessingResult>;

    /// Whether [`LayerHandler::process_stream`] yields chunks incrementally
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Prepare with full access to the context, then hand back a stream
    /// of content chunks. The default runs [`LayerHandler::process`] and
    /// yields its `content` as one chunk.
    async fn process_stream(
        &self,
        layer: &Layer,
        ctx: &mut ProcessingContext,
    ) -> PipelineResult<ChunkStream> {
        let result = self.process(layer, ctx).await?;
        if !result.is_success() {
            return Err(PipelineError::FatalLayer {
                layer: layer.name().to_string(),
                message: result.error_message().unwrap_or_default().to_string(),
            });
        }
        let content = result.content().unwrap_or_default().to_string();
        let stream: ChunkStream = Box::pin(futures::stream::once(async move { Ok(content) }));
        Ok(stream)
    }
}

/// Top-level stage owning an ordered set of modules
pub struct Layer {
    name: String,
    enabled: bool,
    lifecycle: Lifecycle,
    modules: Vec<Module>,
    handler: Arc<dyn LayerHandler>,
}

impl Layer {
    pub fn new(name: impl Into<String>, handler: Arc<dyn LayerHandler>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            lifecycle: Lifecycle::new(),
            modules: Vec::new(),
            handler,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Append a module. Names must be unique within the layer.
    pub fn add_module(&mut self, module: Module) -> PipelineResult<()> {
        if self.get_module(module.name()).is_some() {
            return Err(crate::config_error!(
                "duplicate module {} in layer {}",
                module.name(),
                self.name
            ));
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn get_module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name() == name)
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn supports_streaming(&self) -> bool {
        self.handler.supports_streaming()
    }

    /// Run enabled modules in declaration order, optionally restricted to
    /// `only`, recording each result under `"layer.module"`.
    pub async fn process_modules(
        &self,
        ctx: &mut ProcessingContext,
        only: Option<&[&str]>,
    ) -> StageResults {
        let mut results = StageResults::new();

        for module in self
            .modules
            .iter()
            .filter(|m| m.is_enabled())
            .filter(|m| only.map_or(true, |names| names.iter().any(|n| *n == m.name())))
        {
            let result = module.process(ctx).await;
            let key = qualified_name(&self.name, module.name());
            let result = match ctx.insert_module_output(key, result.clone()) {
                Ok(()) => result,
                Err(err) => {
                    error!("Layer {}: {}", self.name, err);
                    ProcessingResult::from_error(&err)
                }
            };
            results.push(module.name().to_string(), result);
        }

        let failed = results.failed();
        if !failed.is_empty() {
            warn!("Layer {}: modules failed: {}", self.name, failed.join(", "));
        }
        results
    }

    /// Run the layer for one request. Never fails; a failing result is
    /// what the orchestrator escalates.
    pub async fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        if let Some(result) = self.not_ready() {
            return result;
        }

        guarded(&self.name, self.handler.process(self, ctx))
            .await
            .unwrap_or_else(|err| {
                warn!("Layer {} failed: {}", self.name, err);
                ProcessingResult::from_error(&err)
            })
    }

    /// Streaming counterpart of [`Layer::process`]
    pub async fn process_stream(&self, ctx: &mut ProcessingContext) -> PipelineResult<ChunkStream> {
        if let Some(result) = self.not_ready() {
            return Err(PipelineError::FatalLayer {
                layer: self.name.clone(),
                message: result.error_message().unwrap_or_default().to_string(),
            });
        }
        guarded(&self.name, self.handler.process_stream(self, ctx)).await
    }

    fn not_ready(&self) -> Option<ProcessingResult> {
        (!self.lifecycle.is_completed()).then(|| {
            ProcessingResult::failure(format!(
                "layer {} is not initialized ({})",
                self.name,
                self.phase().as_str()
            ))
        })
    }
}

#[async_trait]
impl Stage for Layer {
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
                if !guarded_setup(&self.name, self.handler.setup()).await {
                    return false;
                }
                let outcomes = initialize_all(&self.modules).await;
                log_failed_children(&self.name, &outcomes);
                true
            })
            .await
    }

    fn reset(&self) {
        self.lifecycle.reset();
        self.modules.iter().for_each(Stage::reset);
    }

    fn status(&self) -> StageStatus {
        StageStatus {
            name: self.name.clone(),
            enabled: self.enabled,
            phase: self.phase(),
            children: self.modules.iter().map(Stage::status).collect(),
        }
    }
}
