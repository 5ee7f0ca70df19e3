//! Pipeline assembly from configuration
//!
//! Stage kinds named in the config are resolved through static builder
//! tables. An unknown kind fails the whole build; nothing is substituted.

pub mod chat;
pub mod layers;
pub mod memory;
pub mod passthrough;

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_yaml::Value as YamlValue;

use crate::{
    config::{Config, LayerConfig, ModuleConfig, SubModuleConfig},
    config_error,
    core::{
        LlmProvider, MemorySystem, PipelineError, PipelineResult, ProcessingContext,
        ProviderRegistry,
    },
    orchestration::{Orchestrator, OrchestratorOptions},
    stage::{Layer, LayerHandler, Module, SubModule, SubModuleHandler},
};

/// Providers shared by every stage of one pipeline
#[derive(Clone)]
pub struct StageDeps {
    pub llm: Arc<dyn LlmProvider>,
    pub memory: Option<Arc<dyn MemorySystem>>,
    /// Per-call bound on LLM requests, from the provider config
    pub llm_timeout: Option<Duration>,
}

pub type SubModuleBuildFn = fn(YamlValue, &StageDeps) -> PipelineResult<Arc<dyn SubModuleHandler>>;

pub type LayerBuildFn = fn(YamlValue, &StageDeps) -> PipelineResult<Arc<dyn LayerHandler>>;

static SUBMODULE_BUILDERS: Lazy<HashMap<&'static str, SubModuleBuildFn>> = Lazy::new(|| {
    let arr: Vec<(&str, SubModuleBuildFn)> = vec![
        (chat::CHAT_KIND, chat::create_chat_handler),
        (chat::STRUCTURED_KIND, chat::create_structured_chat_handler),
        (memory::KIND, memory::create_memory_search_handler),
        (passthrough::KIND, passthrough::create_passthrough_handler),
    ];
    arr.into_iter().collect()
});

static LAYER_BUILDERS: Lazy<HashMap<&'static str, LayerBuildFn>> = Lazy::new(|| {
    let arr: Vec<(&str, LayerBuildFn)> = vec![
        (layers::SEQUENTIAL_KIND, layers::create_sequential_layer),
        (layers::RESPOND_KIND, layers::create_respond_layer),
    ];
    arr.into_iter().collect()
});

/// Build the handler for a submodule kind
pub fn build_submodule_handler(
    kind: &str,
    cfg: YamlValue,
    deps: &StageDeps,
) -> PipelineResult<Arc<dyn SubModuleHandler>> {
    let builder = SUBMODULE_BUILDERS
        .get(kind)
        .ok_or_else(|| config_error!("Unknown submodule kind: {}", kind))?;
    builder(cfg, deps)
}

/// Build the handler for a layer kind
pub fn build_layer_handler(
    kind: &str,
    cfg: YamlValue,
    deps: &StageDeps,
) -> PipelineResult<Arc<dyn LayerHandler>> {
    let builder = LAYER_BUILDERS
        .get(kind)
        .ok_or_else(|| config_error!("Unknown layer kind: {}", kind))?;
    builder(cfg, deps)
}

/// Deserialize a stage's opaque config block; a missing block means defaults
pub(crate) fn stage_config<T>(kind: &str, cfg: YamlValue) -> PipelineResult<T>
where
    T: DeserializeOwned + Default,
{
    if cfg.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(cfg).map_err(|e| config_error!("Invalid {} stage config: {}", kind, e))
}

fn build_submodule(cfg: &SubModuleConfig, deps: &StageDeps) -> PipelineResult<SubModule> {
    let handler = build_submodule_handler(&cfg.kind, cfg.config.clone(), deps)?;
    Ok(SubModule::new(&cfg.name, handler).with_enabled(cfg.enabled))
}

fn build_module(cfg: &ModuleConfig, deps: &StageDeps) -> PipelineResult<Module> {
    let mut module = Module::new(&cfg.name)
        .with_enabled(cfg.enabled)
        .with_parallel(cfg.parallel);
    for submodule in &cfg.submodules {
        module.add_submodule(build_submodule(submodule, deps)?)?;
    }
    Ok(module)
}

fn build_layer(cfg: &LayerConfig, deps: &StageDeps) -> PipelineResult<Layer> {
    let handler = build_layer_handler(&cfg.kind, cfg.config.clone(), deps)?;
    let mut layer = Layer::new(&cfg.name, handler).with_enabled(cfg.enabled);
    for module in &cfg.modules {
        layer.add_module(build_module(module, deps)?)?;
    }
    debug!(
        "Built layer {} ({}) with {} modules",
        cfg.name,
        cfg.kind,
        cfg.modules.len()
    );
    Ok(layer)
}

/// Create the providers and the stage tree described by `config`
pub fn build_orchestrator(
    config: &Config,
    registry: &ProviderRegistry,
) -> PipelineResult<Orchestrator> {
    let llm = registry.create_llm(&config.providers.llm)?;
    let memory = config
        .providers
        .memory
        .as_ref()
        .map(|cfg| registry.create_memory(cfg))
        .transpose()?;

    let deps = StageDeps {
        llm: llm.clone(),
        memory: memory.clone(),
        llm_timeout: config.providers.llm.timeout(),
    };

    let layers = config
        .layers
        .iter()
        .map(|layer| build_layer(layer, &deps))
        .collect::<PipelineResult<Vec<_>>>()?;
    info!("Built pipeline with {} layers", layers.len());

    let mut orchestrator =
        Orchestrator::new(layers, OrchestratorOptions::from(&config.system))?.with_llm(llm);
    if let Some(memory) = memory {
        orchestrator = orchestrator.with_memory(memory);
    }
    Ok(orchestrator)
}

/// Await an LLM call, bounded by the provider timeout and the request
/// deadline
pub(crate) async fn call_llm<F, T>(
    ctx: &ProcessingContext,
    timeout: Option<Duration>,
    label: &str,
    fut: F,
) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    let fut = async {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| PipelineError::Timeout(label.to_string()))?,
            None => fut.await,
        }
    };
    ctx.bounded(label, fut).await
}

/// Text gathered from earlier stages: contents of finished layers and
/// memories retrieved by memory-search submodules
pub(crate) fn context_notes(ctx: &ProcessingContext) -> Vec<String> {
    let mut notes: Vec<String> = ctx
        .layer_outputs()
        .values()
        .filter_map(|result| result.content())
        .filter(|content| !content.is_empty())
        .map(str::to_string)
        .collect();

    for result in ctx.submodule_outputs().values().filter(|r| r.is_success()) {
        if let Some(Value::Array(memories)) = result.get("memories") {
            notes.extend(memories.iter().filter_map(Value::as_str).map(str::to_string));
        }
    }
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    fn deps() -> StageDeps {
        let registry = ProviderRegistry::with_builtins();
        StageDeps {
            llm: registry.create_llm(&ProviderConfig::new("echo")).unwrap(),
            memory: None,
            llm_timeout: None,
        }
    }

    #[test]
    fn test_unknown_kinds_fail_fast() {
        let deps = deps();
        let err = build_submodule_handler("telepathy", YamlValue::Null, &deps)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(build_layer_handler("nope", YamlValue::Null, &deps).is_err());
    }

    #[test]
    fn test_builtin_kinds_resolve() {
        let deps = deps();
        for kind in ["chat", "structured_chat", "memory_search", "passthrough"] {
            assert!(build_submodule_handler(kind, YamlValue::Null, &deps).is_ok());
        }
        for kind in ["sequential", "respond"] {
            assert!(build_layer_handler(kind, YamlValue::Null, &deps).is_ok());
        }
    }

    #[test]
    fn test_invalid_stage_config_rejected() {
        let cfg: YamlValue = serde_yaml::from_str("limit: many").unwrap();
        assert!(build_submodule_handler("memory_search", cfg, &deps()).is_err());
    }

    const PIPELINE: &str = r#"
providers:
  llm:
    provider: echo
  memory:
    provider: in_memory
layers:
  - name: perception
    modules:
      - name: context
        parallel: true
        submodules:
          - name: query
            kind: passthrough
          - name: recall
            kind: memory_search
  - name: analysis
    modules:
      - name: intent
        submodules:
          - name: classify
            kind: structured_chat
  - name: response
    kind: respond
    config:
      system_prompt: be brief
"#;

    #[tokio::test]
    async fn test_configured_pipeline_answers() {
        let _ = env_logger::builder().is_test(true).try_init();
        let conf = Config::from_yaml(PIPELINE).unwrap();
        let orchestrator = build_orchestrator(&conf, &ProviderRegistry::with_builtins()).unwrap();

        let report = orchestrator.initialize().await.unwrap();
        assert!(!report.degraded);
        assert!(report.memory_available);

        let response = orchestrator
            .process("u1", "tell me a joke", serde_json::Map::new())
            .await;
        assert!(response.success);
        assert_eq!(response.content.as_deref(), Some("tell me a joke"));

        let layers: Vec<&str> = response.per_layer_outputs.keys().map(String::as_str).collect();
        assert_eq!(layers, vec!["analysis", "perception", "response"]);
        let intent = &response.per_layer_outputs["analysis"];
        assert_eq!(
            intent.get("intent").and_then(|m| m.pointer("/classify/degraded")),
            Some(&serde_json::json!(true))
        );

        orchestrator.shutdown().await;
    }

    #[test]
    fn test_unsupported_provider_stops_build() {
        let conf = Config::from_yaml(
            r#"
providers:
  llm:
    provider: hal9000
layers:
  - name: one
"#,
        )
        .unwrap();
        let err = build_orchestrator(&conf, &ProviderRegistry::with_builtins())
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::UnsupportedProvider(name) if name == "hal9000"));
    }
}
