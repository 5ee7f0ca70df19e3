//! Layer kinds
//!
//! `sequential` runs its modules in order and merges what they produced.
//! `respond` runs its modules as preparation, then answers the query with
//! the LLM; it is the stream-capable layer.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use serde_yaml::Value as YamlValue;

use super::{call_llm, chat::build_messages, stage_config, StageDeps};
use crate::{
    core::{
        ChunkStream, DataMap, LlmProvider, PipelineError, PipelineResult, ProcessingContext,
        ProcessingResult,
    },
    stage::{Layer, LayerHandler, Stage, StageResults},
};

pub const SEQUENTIAL_KIND: &str = "sequential";
pub const RESPOND_KIND: &str = "respond";

/// Most recent `content` text among the successful module results
fn last_content(results: &StageResults) -> Option<String> {
    results
        .iter()
        .filter(|(_, r)| r.is_success())
        .flat_map(|(_, r)| r.data().values())
        .filter_map(|sub| sub.get("content").and_then(Value::as_str))
        .last()
        .map(str::to_string)
}

pub fn create_sequential_layer(
    _cfg: YamlValue,
    _deps: &StageDeps,
) -> PipelineResult<Arc<dyn LayerHandler>> {
    Ok(Arc::new(SequentialLayer))
}

/// Runs every module and keeps the successful outputs under the module
/// name. Fails only when it has modules and all of them failed.
pub struct SequentialLayer;

#[async_trait]
impl LayerHandler for SequentialLayer {
    async fn process(
        &self,
        layer: &Layer,
        ctx: &mut ProcessingContext,
    ) -> PipelineResult<ProcessingResult> {
        let results = layer.process_modules(ctx, None).await;
        let failed = results.failed();

        if !results.is_empty() && failed.len() == results.len() {
            return Err(PipelineError::stage(
                layer.name(),
                format!("all modules failed: {}", failed.join(", ")),
            ));
        }

        let mut data = DataMap::new();
        for (name, result) in results.iter().filter(|(_, r)| r.is_success()) {
            data.insert(name.to_string(), Value::Object(result.data().clone()));
        }
        if let Some(content) = last_content(&results) {
            data.insert("content".to_string(), Value::String(content));
        }

        let failed: Vec<Value> = failed.into_iter().map(|n| json!(n)).collect();
        Ok(ProcessingResult::success(data)
            .with_metadata("module_count", results.len())
            .with_metadata("failed_modules", failed))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RespondConfig {
    pub system_prompt: Option<String>,
}

pub fn create_respond_layer(
    cfg: YamlValue,
    deps: &StageDeps,
) -> PipelineResult<Arc<dyn LayerHandler>> {
    let config: RespondConfig = stage_config(RESPOND_KIND, cfg)?;
    Ok(Arc::new(RespondLayer {
        config,
        llm: deps.llm.clone(),
        timeout: deps.llm_timeout,
    }))
}

/// Produces the user-facing answer from everything gathered so far
pub struct RespondLayer {
    config: RespondConfig,
    llm: Arc<dyn LlmProvider>,
    timeout: Option<Duration>,
}

impl RespondLayer {
    async fn prepare(&self, layer: &Layer, ctx: &mut ProcessingContext) {
        let results = layer.process_modules(ctx, None).await;
        debug!(
            "Layer {} prepared with {} modules ({} failed)",
            layer.name(),
            results.len(),
            results.failed().len()
        );
    }
}

#[async_trait]
impl LayerHandler for RespondLayer {
    async fn setup(&self) -> PipelineResult<()> {
        if self.llm.is_initialized() || self.llm.initialize().await {
            Ok(())
        } else {
            Err(PipelineError::Provider(format!(
                "LLM provider {} is not available",
                self.llm.provider_name()
            )))
        }
    }

    async fn process(
        &self,
        layer: &Layer,
        ctx: &mut ProcessingContext,
    ) -> PipelineResult<ProcessingResult> {
        self.prepare(layer, ctx).await;

        let messages = build_messages(ctx, self.config.system_prompt.as_deref(), true);
        let response = call_llm(ctx, self.timeout, layer.name(), self.llm.chat(&messages)).await?;

        Ok(ProcessingResult::success_value(json!({
            "content": response.content,
            "model": response.model,
            "finish_reason": response.finish_reason,
        })))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn process_stream(
        &self,
        layer: &Layer,
        ctx: &mut ProcessingContext,
    ) -> PipelineResult<ChunkStream> {
        self.prepare(layer, ctx).await;

        let messages = build_messages(ctx, self.config.system_prompt.as_deref(), true);
        Ok(self.llm.clone().chat_stream(messages))
    }
}
