//! Request execution
//!
//! The orchestrator runs the layers of one request strictly in declared
//! order. A layer that reports failure aborts the request: later layers are
//! never invoked and never appear in the layer outputs.

use std::{collections::BTreeMap, ops::Range, sync::Arc, time::Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use super::{
    flow::{FlowLog, FlowType, InformationFlow},
    metrics,
    persistence::{PersistenceJob, PersistenceQueue},
    stats::RollingStats,
    InitReport, OrchestratorOptions,
};
use crate::{
    core::{
        DataMap, HistoryEntry, HistoryStatus, Lifecycle, LlmProvider, MemorySystem, Phase,
        PipelineError, PipelineResult, ProcessingContext, ProcessingResult, UserContext,
    },
    stage::{Layer, Stage},
};

pub(crate) const SYSTEM_STAGE: &str = "system";

/// Error part of a failed [`PipelineResponse`]
#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

impl From<&PipelineError> for ResponseError {
    fn from(err: &PipelineError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingBreakdown {
    pub total_ms: f64,
    pub per_layer_ms: BTreeMap<String, f64>,
}

/// Outcome of [`Orchestrator::process`]
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub success: bool,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    pub per_layer_outputs: BTreeMap<String, ProcessingResult>,
    /// Keyed `"layer.module"`
    pub module_outputs: BTreeMap<String, ProcessingResult>,
    /// Keyed `"module.submodule"`, failures included
    pub submodule_outputs: BTreeMap<String, ProcessingResult>,
    pub timing_breakdown: TimingBreakdown,
    pub history: Vec<HistoryEntry>,
}

impl PipelineResponse {
    fn rejected(err: &PipelineError) -> Self {
        Self {
            success: false,
            request_id: String::new(),
            content: None,
            error: Some(err.into()),
            per_layer_outputs: BTreeMap::new(),
            module_outputs: BTreeMap::new(),
            submodule_outputs: BTreeMap::new(),
            timing_breakdown: TimingBreakdown::default(),
            history: Vec::new(),
        }
    }

    /// Qualified keys of the submodules that failed during the request
    pub fn failed_submodules(&self) -> Vec<&str> {
        self.submodule_outputs
            .iter()
            .filter(|(_, result)| !result.is_success())
            .map(|(key, _)| key.as_str())
            .collect()
    }
}

/// Top-level executor of the layer pipeline
pub struct Orchestrator {
    pub(super) layers: Vec<Layer>,
    pub(super) llm: Option<Arc<dyn LlmProvider>>,
    pub(super) memory: Option<Arc<dyn MemorySystem>>,
    pub(super) options: OrchestratorOptions,
    pub(super) lifecycle: Lifecycle,
    pub(super) report: ArcSwap<InitReport>,
    pub(super) persistence: ArcSwapOption<PersistenceQueue>,
    pub(super) flows: FlowLog,
    pub(super) stats: RollingStats,
}

impl Orchestrator {
    /// Build an orchestrator over a fixed, ordered set of layers
    pub fn new(layers: Vec<Layer>, options: OrchestratorOptions) -> PipelineResult<Self> {
        for (i, layer) in layers.iter().enumerate() {
            if layers[..i].iter().any(|l| l.name() == layer.name()) {
                return Err(crate::config_error!("duplicate layer {}", layer.name()));
            }
        }

        Ok(Self {
            flows: FlowLog::new(options.flow_capacity),
            layers,
            llm: None,
            memory: None,
            options,
            lifecycle: Lifecycle::new(),
            report: ArcSwap::from_pointee(InitReport::default()),
            persistence: ArcSwapOption::empty(),
            stats: RollingStats::new(),
        })
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySystem>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle.is_completed()
    }

    /// Run one request through every layer
    pub async fn process(
        &self,
        user_id: &str,
        query: &str,
        session_context: DataMap,
    ) -> PipelineResponse {
        if let Err(err) = self.check_ready() {
            return PipelineResponse::rejected(&err);
        }

        let started = Instant::now();
        let mut ctx = self.new_context(user_id, query, session_context);
        info!("Processing request {} for user {}", ctx.request_id(), user_id);

        let outcome = self.run_layers(&mut ctx, 0..self.layers.len()).await;
        self.finish(ctx, outcome, started, "batch")
    }

    pub(super) fn check_ready(&self) -> PipelineResult<()> {
        if self.lifecycle.is_completed() {
            Ok(())
        } else {
            Err(PipelineError::Initialization(format!(
                "pipeline is not initialized ({})",
                self.lifecycle.phase().as_str()
            )))
        }
    }

    pub(super) fn new_context(
        &self,
        user_id: &str,
        query: &str,
        session_context: DataMap,
    ) -> ProcessingContext {
        ProcessingContext::new(user_id, query, session_context)
            .with_timeout(self.options.request_timeout)
    }

    /// Run the enabled layers in `range`, stopping at the first failure
    pub(super) async fn run_layers(
        &self,
        ctx: &mut ProcessingContext,
        range: Range<usize>,
    ) -> PipelineResult<()> {
        for layer in &self.layers[range] {
            if !self.should_run(ctx, layer) {
                continue;
            }

            self.record_input(ctx, layer);
            let started = Instant::now();

            let result = match ctx.deadline() {
                Some(deadline) => tokio::time::timeout_at(deadline, layer.process(ctx))
                    .await
                    .unwrap_or_else(|_| {
                        ProcessingResult::from_error(&PipelineError::Timeout(
                            layer.name().to_string(),
                        ))
                    }),
                None => layer.process(ctx).await,
            };

            self.complete_layer(ctx, layer, result, started)?;
        }
        Ok(())
    }

    /// Enabled layers that failed to initialize are skipped, not fatal
    pub(super) fn should_run(&self, ctx: &mut ProcessingContext, layer: &Layer) -> bool {
        if !layer.is_enabled() {
            return false;
        }
        if layer.phase() != Phase::Completed {
            debug!("Skipping layer {} ({})", layer.name(), layer.phase().as_str());
            ctx.record_history(
                layer.name(),
                HistoryStatus::Skipped,
                Default::default(),
                Some(format!("layer not initialized ({})", layer.phase().as_str())),
            );
            return false;
        }
        true
    }

    pub(super) fn record_input(&self, ctx: &ProcessingContext, layer: &Layer) {
        self.flows.record(InformationFlow::new(
            SYSTEM_STAGE,
            layer.name(),
            FlowType::Input,
            ctx.query(),
        ));
    }

    /// Record a finished layer. A failing result becomes the request's
    /// fatal error and is not merged into the layer outputs.
    pub(super) fn complete_layer(
        &self,
        ctx: &mut ProcessingContext,
        layer: &Layer,
        result: ProcessingResult,
        started: Instant,
    ) -> PipelineResult<()> {
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let success = result.is_success();

        self.stats.record_layer(layer.name(), elapsed_ms);
        metrics::observe_layer(layer.name(), success, elapsed_ms);
        self.flows.record(InformationFlow::new(
            layer.name(),
            SYSTEM_STAGE,
            FlowType::Output,
            &output_summary(&result),
        ));

        if success {
            ctx.record_history(layer.name(), HistoryStatus::Completed, elapsed, None);
            ctx.insert_layer_output(layer.name(), result)
        } else {
            let message = result
                .error_message()
                .unwrap_or("layer reported failure")
                .to_string();
            warn!("Layer {} failed, aborting request: {}", layer.name(), message);
            ctx.record_history(
                layer.name(),
                HistoryStatus::Failed,
                elapsed,
                Some(message.clone()),
            );
            Err(PipelineError::FatalLayer {
                layer: layer.name().to_string(),
                message,
            })
        }
    }

    /// Content of the last layer that produced one, in declared order
    pub(super) fn final_content(&self, ctx: &ProcessingContext) -> Option<String> {
        self.layers
            .iter()
            .rev()
            .filter_map(|layer| ctx.layer_output(layer.name()))
            .find_map(|result| result.content().map(str::to_string))
    }

    /// Update statistics, schedule persistence and build the response
    pub(super) fn finish(
        &self,
        ctx: ProcessingContext,
        outcome: PipelineResult<()>,
        started: Instant,
        mode: &str,
    ) -> PipelineResponse {
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;
        let success = outcome.is_ok();

        self.stats.record_request(success, total_ms);
        metrics::observe_request(mode, success, total_ms);
        for (stage, result) in ctx.submodule_outputs() {
            if !result.is_success() {
                metrics::count_submodule_failure(stage);
            }
        }

        let content = if success {
            Some(self.final_content(&ctx).unwrap_or_default())
        } else {
            None
        };

        if let Some(content) = content.as_deref().filter(|c| !c.is_empty()) {
            self.schedule_persistence(&ctx, content);
        }

        let per_layer_ms = ctx
            .history()
            .iter()
            .filter(|entry| entry.status != HistoryStatus::Skipped)
            .map(|entry| (entry.stage.clone(), entry.elapsed_ms))
            .collect();

        match &outcome {
            Ok(()) => info!(
                "Request {} completed in {:.2}ms",
                ctx.request_id(),
                total_ms
            ),
            Err(e) => warn!("Request {} failed: {}", ctx.request_id(), e),
        }

        PipelineResponse {
            success,
            request_id: ctx.request_id().to_string(),
            content,
            error: outcome.as_ref().err().map(ResponseError::from),
            per_layer_outputs: ctx.layer_outputs().clone(),
            module_outputs: ctx.module_outputs().clone(),
            submodule_outputs: ctx.submodule_outputs().clone(),
            timing_breakdown: TimingBreakdown {
                total_ms,
                per_layer_ms,
            },
            history: ctx.history().to_vec(),
        }
    }

    fn schedule_persistence(&self, ctx: &ProcessingContext, content: &str) {
        if !self.options.persist_results {
            return;
        }
        let Some(queue) = self.persistence.load_full() else {
            return;
        };

        queue.enqueue(PersistenceJob {
            request_id: ctx.request_id().to_string(),
            user_context: UserContext::new(ctx.user_id(), ctx.session_id().map(str::to_string)),
            query: ctx.query().to_string(),
            response: content.to_string(),
        });
    }
}

fn output_summary(result: &ProcessingResult) -> String {
    if let Some(error) = result.error_message() {
        return format!("error: {error}");
    }
    match result.content() {
        Some(content) => content.to_string(),
        None => Value::Object(result.data().clone()).to_string(),
    }
}
